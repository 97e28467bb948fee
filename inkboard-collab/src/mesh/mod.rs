//! Direct peer-to-peer links for low-latency previews.
//!
//! One [`PeerConnection`] per remote participant:
//!
//! ```text
//! New ──offer/answer──► Connecting ──channel open──► Connected
//!                           │                           │
//!                           └──► Failed      Disconnected ◄┘
//!                                   └──── close ────► Closed
//! ```
//!
//! The mesh carries JSON [`Envelope`]s. It is never authoritative: every
//! drawing operation it delivers also reaches peers through the relay.

pub mod envelope;
pub mod memory;
pub mod signaling;

use std::collections::HashMap;
use std::sync::Arc;

use inkboard_core::UserId;

pub use envelope::{Envelope, EnvelopeKind, FileShare};
pub use memory::{MemoryChannel, MemoryConnector, MemoryNetwork};
pub use signaling::{
    DataChannel, DataChannelConfig, IceCandidate, LinkEvent, MediaConstraints, MediaDevices,
    MediaStream, PeerConnector, SdpKind, SessionDescription,
};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub struct PeerConnection {
    pub peer_id: UserId,
    pub state: PeerState,
    channel: Option<Arc<dyn DataChannel>>,
}

impl PeerConnection {
    fn new(peer_id: UserId) -> Self {
        Self {
            peer_id,
            state: PeerState::New,
            channel: None,
        }
    }

    fn release(&mut self, state: PeerState) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.state = state;
    }
}

/// What the coordinator needs to know about link traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerConnected(UserId),
    PeerLeft(UserId),
    Envelope { from: UserId, envelope: Envelope },
}

pub struct PeerMesh {
    local_user: UserId,
    connector: Arc<dyn PeerConnector>,
    config: DataChannelConfig,
    peers: HashMap<UserId, PeerConnection>,
    media: Option<MediaStream>,
}

impl PeerMesh {
    pub fn new(local_user: UserId, connector: Arc<dyn PeerConnector>, config: DataChannelConfig) -> Self {
        Self {
            local_user,
            connector,
            config,
            peers: HashMap::new(),
            media: None,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn config(&self) -> &DataChannelConfig {
        &self.config
    }

    // ── Negotiation ─────────────────────────────────────────────

    /// Start negotiating with `peer`. The offer goes to the peer out of band.
    pub async fn connect_to(&mut self, peer: &UserId) -> Result<SessionDescription, TransportError> {
        self.begin(peer);
        let result = self.connector.create_offer(peer, &self.config).await;
        self.settle(peer, result)
    }

    /// Answer an offer from `peer`.
    pub async fn accept_offer(
        &mut self,
        peer: &UserId,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.begin(peer);
        let result = self.connector.create_answer(peer, offer).await;
        self.settle(peer, result)
    }

    pub async fn handle_answer(
        &mut self,
        peer: &UserId,
        answer: &SessionDescription,
    ) -> Result<(), TransportError> {
        let result = self.connector.handle_answer(peer, answer).await;
        self.settle(peer, result)
    }

    pub async fn handle_ice_candidate(
        &mut self,
        peer: &UserId,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        let result = self.connector.handle_ice_candidate(peer, candidate).await;
        self.settle(peer, result)
    }

    fn begin(&mut self, peer: &UserId) {
        let conn = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerConnection::new(peer.clone()));
        if conn.state != PeerState::Connected {
            conn.state = PeerState::Connecting;
        }
    }

    /// A rejected late answer or candidate leaves an open link alone; only
    /// a negotiation still in progress is marked failed.
    fn settle<T>(&mut self, peer: &UserId, result: Result<T, TransportError>) -> Result<T, TransportError> {
        result.map_err(|e| {
            log::warn!("Signaling with {peer} failed: {e}");
            match self.peers.get_mut(peer) {
                Some(conn) if conn.state == PeerState::Connected => {}
                Some(conn) => conn.release(PeerState::Failed),
                None => {}
            }
            match e {
                TransportError::Signaling(reason) => TransportError::Signaling(reason),
                other => TransportError::Signaling(other.to_string()),
            }
        })
    }

    // ── Link events ─────────────────────────────────────────────

    pub fn handle_link_event(&mut self, event: LinkEvent) -> Option<MeshEvent> {
        match event {
            LinkEvent::ChannelOpen { peer, channel } => {
                let conn = self
                    .peers
                    .entry(peer.clone())
                    .or_insert_with(|| PeerConnection::new(peer.clone()));
                if let Some(old) = conn.channel.replace(channel) {
                    old.close();
                }
                conn.state = PeerState::Connected;
                log::info!("Mesh link to {peer} open");
                Some(MeshEvent::PeerConnected(peer))
            }
            LinkEvent::Message { peer, text } => match Envelope::decode(&text) {
                Ok(envelope) => Some(MeshEvent::Envelope { from: peer, envelope }),
                Err(e) => {
                    log::warn!("Dropping malformed envelope from {peer}: {e}");
                    None
                }
            },
            LinkEvent::Closed { peer } => {
                let conn = self.peers.get_mut(&peer)?;
                let was_connected = conn.state == PeerState::Connected;
                if conn.state != PeerState::Closed {
                    conn.channel = None;
                    conn.state = PeerState::Disconnected;
                }
                log::info!("Mesh link to {peer} closed");
                was_connected.then_some(MeshEvent::PeerLeft(peer))
            }
            LinkEvent::Failed { peer, reason } => {
                log::warn!("Mesh link to {peer} failed: {reason}");
                let conn = self.peers.get_mut(&peer)?;
                let was_connected = conn.state == PeerState::Connected;
                conn.channel = None;
                conn.state = PeerState::Failed;
                was_connected.then_some(MeshEvent::PeerLeft(peer))
            }
        }
    }

    // ── Sending ─────────────────────────────────────────────────

    /// Send to every connected peer. Returns how many sends succeeded.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to encode {:?} envelope: {e}", envelope.kind);
                return 0;
            }
        };

        let mut sent = 0;
        for conn in self.peers.values() {
            let Some(channel) = conn.channel.as_ref().filter(|_| conn.state == PeerState::Connected) else {
                continue;
            };
            match channel.send(&text) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Mesh send to {} failed: {e}", conn.peer_id),
            }
        }
        log::trace!("Mesh broadcast {:?} to {sent} peers", envelope.kind);
        sent
    }

    pub fn send_to(&self, peer: &UserId, envelope: &Envelope) -> Result<(), TransportError> {
        let channel = self
            .peers
            .get(peer)
            .filter(|conn| conn.state == PeerState::Connected)
            .and_then(|conn| conn.channel.as_ref())
            .ok_or_else(|| TransportError::PeerNotConnected(peer.clone()))?;
        channel.send(&envelope.encode()?)
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Close the link and forget the peer.
    pub fn close_peer(&mut self, peer: &UserId) {
        if let Some(mut conn) = self.peers.remove(peer) {
            conn.release(PeerState::Closed);
            self.connector.close(peer);
        }
    }

    pub fn close_all(&mut self) {
        let peers: Vec<UserId> = self.peers.keys().cloned().collect();
        for peer in &peers {
            self.close_peer(peer);
        }
        self.media = None;
        if !peers.is_empty() {
            log::info!("Closed {} mesh links", peers.len());
        }
    }

    /// Acquire local media. Failure leaves the session running without it.
    pub async fn acquire_media(&mut self, devices: &dyn MediaDevices) -> bool {
        let constraints = MediaConstraints { audio: true, video: false };
        match devices.get_user_media(constraints).await {
            Ok(stream) => {
                log::info!("Acquired media stream {}", stream.id);
                self.media = Some(stream);
                true
            }
            Err(e) => {
                log::warn!("Continuing without media: {e}");
                false
            }
        }
    }

    pub fn media_stream(&self) -> Option<&MediaStream> {
        self.media.as_ref()
    }

    pub fn peer_state(&self, peer: &UserId) -> Option<PeerState> {
        self.peers.get(peer).map(|conn| conn.state)
    }

    pub fn connected_peers(&self) -> Vec<UserId> {
        let mut peers: Vec<UserId> = self
            .peers
            .values()
            .filter(|conn| conn.state == PeerState::Connected)
            .map(|conn| conn.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }
}
