//! In-process peer network.
//!
//! Every participant registers an endpoint; negotiation between two
//! registered users opens a pair of [`MemoryChannel`]s immediately. Used by
//! tests and by sessions whose participants share one process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use inkboard_core::UserId;
use tokio::sync::mpsc;

use super::signaling::{
    DataChannel, DataChannelConfig, IceCandidate, LinkEvent, PeerConnector, SessionDescription,
};
use crate::error::TransportError;
use crate::BoxFuture;

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<UserId, mpsc::UnboundedSender<LinkEvent>>,
    /// Open channel per (owner, remote)
    channels: HashMap<(UserId, UserId), Arc<MemoryChannel>>,
    failing: HashSet<UserId>,
}

/// Shared registry of in-process endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` and return its connector plus the link events it receives.
    pub fn connector(&self, user: UserId) -> (MemoryConnector, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().endpoints.insert(user.clone(), tx);
        let connector = MemoryConnector {
            local: user,
            network: self.clone(),
        };
        (connector, rx)
    }

    /// Make every negotiation involving `user` fail.
    pub fn set_failing(&self, user: &UserId, failing: bool) {
        let mut inner = self.lock();
        if failing {
            inner.failing.insert(user.clone());
        } else {
            inner.failing.remove(user);
        }
    }

    /// Simulate an abrupt link loss between `a` and `b`.
    pub fn sever(&self, a: &UserId, b: &UserId) {
        let (ab, ba) = {
            let mut inner = self.lock();
            (
                inner.channels.remove(&(a.clone(), b.clone())),
                inner.channels.remove(&(b.clone(), a.clone())),
            )
        };
        for channel in [ab, ba].into_iter().flatten() {
            channel.close();
        }
    }

    pub fn open_channels(&self) -> usize {
        self.lock()
            .channels
            .values()
            .filter(|c| c.open.load(Ordering::Acquire))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, local: &UserId, peer: &UserId) -> Result<(), TransportError> {
        let inner = self.lock();
        if !inner.endpoints.contains_key(peer) {
            return Err(TransportError::Signaling(format!("unknown peer {peer}")));
        }
        if inner.failing.contains(local) || inner.failing.contains(peer) {
            return Err(TransportError::Signaling(format!(
                "negotiation between {local} and {peer} failed"
            )));
        }
        Ok(())
    }
}

/// One direction of an in-process link. Both halves share the open flag.
pub struct MemoryChannel {
    label: String,
    from: UserId,
    to: mpsc::UnboundedSender<LinkEvent>,
    open: Arc<AtomicBool>,
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Channel(format!("channel {} closed", self.label)));
        }
        self.to
            .send(LinkEvent::Message {
                peer: self.from.clone(),
                text: text.to_string(),
            })
            .map_err(|_| TransportError::Channel("remote endpoint dropped".into()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.to.send(LinkEvent::Closed { peer: self.from.clone() });
        }
    }
}

pub struct MemoryConnector {
    local: UserId,
    network: MemoryNetwork,
}

impl MemoryConnector {
    pub fn local_user(&self) -> &UserId {
        &self.local
    }
}

impl PeerConnector for MemoryConnector {
    fn create_offer<'a>(
        &'a self,
        peer: &'a UserId,
        config: &'a DataChannelConfig,
    ) -> BoxFuture<'a, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            self.network.check(&self.local, peer)?;
            Ok(SessionDescription::offer(config.label.clone()))
        })
    }

    fn create_answer<'a>(
        &'a self,
        peer: &'a UserId,
        offer: &'a SessionDescription,
    ) -> BoxFuture<'a, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            self.network.check(&self.local, peer)?;

            let mut inner = self.network.lock();
            let (Some(local_tx), Some(peer_tx)) = (
                inner.endpoints.get(&self.local).cloned(),
                inner.endpoints.get(peer).cloned(),
            ) else {
                return Err(TransportError::Signaling(format!("unknown peer {peer}")));
            };

            let open = Arc::new(AtomicBool::new(true));
            // Local end writes into the offerer's endpoint and vice versa.
            let to_peer = Arc::new(MemoryChannel {
                label: offer.sdp.clone(),
                from: self.local.clone(),
                to: peer_tx.clone(),
                open: open.clone(),
            });
            let to_local = Arc::new(MemoryChannel {
                label: offer.sdp.clone(),
                from: peer.clone(),
                to: local_tx.clone(),
                open,
            });
            inner
                .channels
                .insert((self.local.clone(), peer.clone()), to_peer.clone());
            inner
                .channels
                .insert((peer.clone(), self.local.clone()), to_local.clone());
            drop(inner);

            let _ = local_tx.send(LinkEvent::ChannelOpen {
                peer: peer.clone(),
                channel: to_peer,
            });
            let _ = peer_tx.send(LinkEvent::ChannelOpen {
                peer: self.local.clone(),
                channel: to_local,
            });
            Ok(SessionDescription::answer(offer.sdp.clone()))
        })
    }

    fn handle_answer<'a>(
        &'a self,
        peer: &'a UserId,
        _answer: &'a SessionDescription,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move { self.network.check(&self.local, peer) })
    }

    fn handle_ice_candidate<'a>(
        &'a self,
        peer: &'a UserId,
        candidate: &'a IceCandidate,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            log::trace!("Ignoring ICE candidate {} for {peer}", candidate.candidate);
            self.network.check(&self.local, peer)
        })
    }

    fn close(&self, peer: &UserId) {
        let channel = self
            .network
            .lock()
            .channels
            .remove(&(self.local.clone(), peer.clone()));
        if let Some(channel) = channel {
            channel.close();
        }
    }
}
