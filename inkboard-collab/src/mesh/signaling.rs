//! Collaborator traits for peer negotiation, data channels and media.
//!
//! The mesh never talks to a network stack directly. A [`PeerConnector`]
//! performs offer/answer/ICE negotiation and reports the resulting links as
//! [`LinkEvent`]s on a channel the coordinator polls.

use std::fmt;
use std::sync::Arc;

use inkboard_core::UserId;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged out of band during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Data channel settings: ordered delivery, bounded retransmits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelConfig {
    pub label: String,
    pub ordered: bool,
    /// `None` means fully reliable
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            label: "inkboard".to_string(),
            ordered: true,
            max_retransmits: Some(3),
        }
    }
}

/// Open data channel to one remote peer. Text frames only.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn send(&self, text: &str) -> Result<(), TransportError>;
    fn close(&self);
}

/// Negotiates peer links. Implementations report link progress as
/// [`LinkEvent`]s on their own channel.
pub trait PeerConnector: Send + Sync {
    fn create_offer<'a>(
        &'a self,
        peer: &'a UserId,
        config: &'a DataChannelConfig,
    ) -> BoxFuture<'a, Result<SessionDescription, TransportError>>;

    fn create_answer<'a>(
        &'a self,
        peer: &'a UserId,
        offer: &'a SessionDescription,
    ) -> BoxFuture<'a, Result<SessionDescription, TransportError>>;

    fn handle_answer<'a>(
        &'a self,
        peer: &'a UserId,
        answer: &'a SessionDescription,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn handle_ice_candidate<'a>(
        &'a self,
        peer: &'a UserId,
        candidate: &'a IceCandidate,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Tear down the link to `peer`, if any.
    fn close(&self, peer: &UserId);
}

/// Progress of a negotiated link.
pub enum LinkEvent {
    ChannelOpen {
        peer: UserId,
        channel: Arc<dyn DataChannel>,
    },
    Message {
        peer: UserId,
        text: String,
    },
    Closed {
        peer: UserId,
    },
    Failed {
        peer: UserId,
        reason: String,
    },
}

impl LinkEvent {
    pub fn peer(&self) -> &UserId {
        match self {
            LinkEvent::ChannelOpen { peer, .. }
            | LinkEvent::Message { peer, .. }
            | LinkEvent::Closed { peer }
            | LinkEvent::Failed { peer, .. } => peer,
        }
    }
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::ChannelOpen { peer, channel } => f
                .debug_struct("ChannelOpen")
                .field("peer", peer)
                .field("label", &channel.label())
                .finish(),
            LinkEvent::Message { peer, text } => f
                .debug_struct("Message")
                .field("peer", peer)
                .field("len", &text.len())
                .finish(),
            LinkEvent::Closed { peer } => f.debug_struct("Closed").field("peer", peer).finish(),
            LinkEvent::Failed { peer, reason } => f
                .debug_struct("Failed")
                .field("peer", peer)
                .field("reason", reason)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub audio_tracks: usize,
    pub video_tracks: usize,
}

/// Local capture devices. Optional: the session runs without media.
pub trait MediaDevices: Send + Sync {
    fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'_, Result<MediaStream, TransportError>>;
}
