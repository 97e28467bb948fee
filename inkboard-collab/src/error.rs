//! Error taxonomy for the collaboration layer.
//!
//! Transport failures are logged and swallowed by local-intent methods;
//! only initialization, state import and image loads hand errors back.

use std::time::Duration;

use inkboard_core::{ObjectId, StoreError, UserId};
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Relay or mesh send/connect failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Signaling failed: {0}")]
    Signaling(String),
    #[error("Peer {0} is not connected")]
    PeerNotConnected(UserId),
    #[error("Data channel error: {0}")]
    Channel(String),
    #[error("Media unavailable: {0}")]
    Media(String),
    #[error("Operation timed out")]
    Timeout,
}

/// Failure reported by a render target.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Render target is not ready")]
    NotReady,
    #[error("Failed to load image: {0}")]
    Image(String),
    #[error("Failed to draw: {0}")]
    Draw(String),
    #[error("Unsupported object: {0}")]
    Object(String),
}

/// Fatal start-up failure; the session must not start.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Render target not ready after {0:?}")]
    Timeout(Duration),
    #[error("Render target failed to initialize: {0}")]
    Render(#[source] RenderError),
}

/// Failure applying one remote item to the render target.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Failed to apply object {id}: {source}")]
    Object {
        id: ObjectId,
        #[source]
        source: RenderError,
    },
    #[error("Failed to apply background: {0}")]
    Background(#[source] RenderError),
    #[error("Failed to apply drawing from {user}: {source}")]
    Drawing {
        user: UserId,
        #[source]
        source: RenderError,
    },
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Initialization(#[from] InitializationError),
    #[error("Failed to restore canvas state: {0}")]
    Deserialization(#[from] StoreError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
