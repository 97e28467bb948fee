//! # inkboard-collab: Real-time sync for the shared whiteboard
//!
//! Two transports carry one replicated document between participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    WebSocket     ┌─────────────┐
//! │ SyncCoordinator │ ◄──────────────► │ SyncServer  │
//! │ (per user)      │   Binary Proto   │ (relay)     │
//! └──┬─────┬─────┬──┘                  └──────┬──────┘
//!    │     │     │  data channels             │
//!    │     │     └──────────► other users     ▼
//!    │     ▼      (PeerMesh)            ┌─────────────┐
//!    │  ┌──────────────┐                │ BroadcastGrp│
//!    │  │ Shared store │                │ + snapshots │
//!    │  │ (yrs doc)    │                └─────────────┘
//!    ▼  └──────────────┘
//! ┌──────────────┐
//! │ RenderTarget │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: Session orchestration and render projection
//! - [`awareness`]: Ephemeral presence (cursors, selection, drawing)
//! - [`mesh`]: Peer-to-peer data channels for low-latency preview and chat
//! - [`client`]: Relay client with offline queue
//! - [`server`]: Relay server with per-room authority docs
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room fan-out with backpressure
//! - [`storage`]: Room snapshots on disk
//! - [`render`]: Contract implemented by the drawing surface
//! - [`dedupe`]: Bounded set of recently seen operations
//! - [`config`]: TOML configuration

use std::future::Future;
use std::pin::Pin;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod dedupe;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod render;
pub mod server;
pub mod storage;

/// Boxed future returned by object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-exports for convenience
pub use awareness::{
    AwarenessChannel, AwarenessEvent, AwarenessMessage, AwarenessState, AwarenessUpdate,
    CursorPosition, UserInfo,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{load_toml, CollabConfig};
pub use coordinator::{CollabEvent, SyncCoordinator};
pub use dedupe::RecentlySeen;
pub use error::{
    ApplyError, CollabError, ConfigError, InitializationError, RenderError, TransportError,
};
pub use mesh::{
    DataChannel, DataChannelConfig, Envelope, EnvelopeKind, FileShare, IceCandidate, LinkEvent,
    MediaDevices, MemoryNetwork, MeshEvent, PeerConnector, PeerMesh, PeerState,
    SessionDescription,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use render::{ImageInfo, Point, RenderEvent, RenderTarget, ShapeGeometry, StrokeSegment};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{SnapshotStore, StorageError};
