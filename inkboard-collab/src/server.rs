//! Relay server: one authoritative document per room.
//!
//! ```text
//! Client A ──┐
//!            ├── Room ("r1") ── Yrs Doc ── BroadcastGroup ──► A, B, C
//! Client B ──┘        │
//!                     └── SnapshotStore (archived when the room empties)
//! ```
//!
//! Join handshake:
//!
//! 1. client → `PeerJoined(info)`
//! 2. server → `SyncStep1(server state vector)`, the other peers'
//!    `PeerJoined` frames and their last awareness frames
//! 3. client → `Delta(diff the server lacks)` and `SyncStep1(client sv)`
//! 4. server → `SyncStep2(diff the client lacks)`
//!
//! After that every `Delta` is merged into the room doc and fanned out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::awareness::AwarenessMessage;
use crate::broadcast::BroadcastGroup;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::storage::{SnapshotStore, StorageError};

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it starts lagging
    pub broadcast_capacity: usize,
    /// WebSocket ping interval
    pub heartbeat_interval_secs: u64,
    /// Snapshot directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_peers: u64,
    pub persisted_snapshots: u64,
}

struct DocumentRoom {
    doc: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
    /// Last awareness frame per connection, replayed to late joiners
    awareness: HashMap<Uuid, Arc<Vec<u8>>>,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            awareness: HashMap::new(),
        }
    }

    fn apply(&self, update: &[u8]) -> Result<(), String> {
        let update = Update::decode_v1(update).map_err(|e| e.to_string())?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| e.to_string())
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, String> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| e.to_string())?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }
}

/// The relay server. Cloning shares the same rooms.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<String, DocumentRoom>>>,
    stats: Arc<RwLock<ServerStats>>,
    snapshots: Arc<SnapshotStore>,
}

impl SyncServer {
    /// Server with in-memory snapshots only.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, SnapshotStore::in_memory())
    }

    /// Server whose snapshots persist under `config.storage_path`.
    pub async fn open(config: ServerConfig) -> Result<Self, StorageError> {
        let store = match &config.storage_path {
            Some(path) => SnapshotStore::open(path.clone()).await?,
            None => SnapshotStore::in_memory(),
        };
        Ok(Self::with_store(config, store))
    }

    fn with_store(config: ServerConfig, snapshots: SnapshotStore) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            snapshots: Arc::new(snapshots),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Load every archived room so it is ready before peers reconnect.
    pub async fn recover(&self) -> Result<usize, StorageError> {
        let names = self.snapshots.rooms().await?;
        let mut recovered = 0;

        let mut rooms = self.rooms.write().await;
        for name in &names {
            if rooms.contains_key(name) {
                continue;
            }
            let room = DocumentRoom::new(self.config.broadcast_capacity);
            if self.restore_snapshot(name, &room).await {
                rooms.insert(name.clone(), room);
                recovered += 1;
            }
        }
        self.stats.write().await.active_rooms = rooms.len();

        log::info!("Recovery complete: {recovered}/{} rooms restored", names.len());
        Ok(recovered)
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from snapshot storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn restore_snapshot(&self, name: &str, room: &DocumentRoom) -> bool {
        match self.snapshots.load(name).await {
            Ok(Some(snapshot)) => match room.apply(&snapshot) {
                Ok(()) => {
                    log::info!("Restored snapshot for room {name}");
                    true
                }
                Err(e) => {
                    log::error!("Snapshot for room {name} does not apply: {e}");
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                log::error!("Failed to load snapshot for room {name}: {e}");
                false
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut peer: Option<PeerInfo> = None;
        let mut room_name: Option<String> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let sync_msg = match SyncMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match sync_msg.msg_type {
                                    MessageType::PeerJoined => {
                                        if peer.is_some() {
                                            log::warn!("Duplicate join from {addr} ignored");
                                            continue;
                                        }
                                        let info = match sync_msg.peer_info() {
                                            Ok(info) => info,
                                            Err(e) => {
                                                log::warn!("Malformed join from {addr}: {e}");
                                                continue;
                                            }
                                        };

                                        let Some(rx) = self
                                            .join_room(&sync_msg.room, &info, &mut ws_sender)
                                            .await?
                                        else {
                                            ws_sender.send(Message::Close(None)).await?;
                                            break;
                                        };
                                        broadcast_rx = Some(rx);
                                        room_name = Some(sync_msg.room.clone());
                                        peer = Some(info);
                                    }

                                    MessageType::Delta => {
                                        let Some(room) = &room_name else { continue };
                                        let group = {
                                            let rooms = self.rooms.read().await;
                                            match rooms.get(room) {
                                                Some(r) => match r.apply(&sync_msg.payload) {
                                                    Ok(()) => Some(r.broadcast.clone()),
                                                    Err(e) => {
                                                        log::warn!("Rejected delta from {addr} in room {room}: {e}");
                                                        None
                                                    }
                                                },
                                                None => None,
                                            }
                                        };
                                        if let Some(group) = group {
                                            let n = group.broadcast_raw(Arc::new(bytes));
                                            log::trace!("Delta in room {room} fanned out to {n} receivers");
                                        }
                                    }

                                    MessageType::SyncStep1 => {
                                        let Some(room) = &room_name else { continue };
                                        let diff = {
                                            let rooms = self.rooms.read().await;
                                            rooms.get(room).map(|r| r.diff(&sync_msg.payload))
                                        };
                                        match diff {
                                            Some(Ok(diff)) => {
                                                let response = SyncMessage::sync_step2(Uuid::nil(), room, diff);
                                                ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                                            }
                                            Some(Err(e)) => log::warn!("Bad state vector from {addr}: {e}"),
                                            None => {}
                                        }
                                    }

                                    MessageType::Awareness => {
                                        let Some(room) = &room_name else { continue };
                                        let message = match sync_msg.awareness_message() {
                                            Ok(m) => m,
                                            Err(e) => {
                                                log::warn!("Malformed awareness from {addr}: {e}");
                                                continue;
                                            }
                                        };
                                        let frame = Arc::new(bytes);
                                        let group = {
                                            let mut rooms = self.rooms.write().await;
                                            rooms.get_mut(room).map(|r| {
                                                match &message {
                                                    AwarenessMessage::Leave { .. } => {
                                                        r.awareness.remove(&sync_msg.peer_id);
                                                    }
                                                    AwarenessMessage::Update { .. } => {
                                                        r.awareness.insert(sync_msg.peer_id, frame.clone());
                                                    }
                                                }
                                                r.broadcast.clone()
                                            })
                                        };
                                        log::trace!("Presence from {} in room {room}", message.user_id());
                                        if let Some(group) = group {
                                            group.broadcast_raw(frame);
                                        }
                                    }

                                    MessageType::Ping => {
                                        let pong = SyncMessage::pong(sync_msg.peer_id);
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    other => {
                                        log::debug!("Unhandled message type from {addr}: {other:?}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    msg = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(data) => {
                                if let (Ok(frame), Some(me)) = (SyncMessage::decode(&data), &peer) {
                                    if frame.peer_id == me.peer_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer at {addr} lagged by {n} frames, resending room state");
                                if let Some(room) = &room_name {
                                    let full = {
                                        let rooms = self.rooms.read().await;
                                        rooms.get(room).map(|r| {
                                            r.broadcast.record_lag(n);
                                            r.full_state()
                                        })
                                    };
                                    if let Some(full) = full {
                                        let resync = SyncMessage::sync_step2(Uuid::nil(), room, full);
                                        ws_sender.send(Message::Binary(resync.encode()?.into())).await?;
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let (Some(info), Some(room)) = (peer, room_name) {
            self.leave_room(&room, &info).await;
        }
        self.stats.write().await.active_connections -= 1;

        result
    }

    /// Register `info` in `room` and send it the handshake frames.
    /// Returns `None` when the room is full.
    async fn join_room<S>(
        &self,
        name: &str,
        info: &PeerInfo,
        ws_sender: &mut S,
    ) -> Result<Option<broadcast::Receiver<Arc<Vec<u8>>>>, Box<dyn std::error::Error + Send + Sync>>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let (rx, sv, others, awareness, group, room_count) = {
            let mut rooms = self.rooms.write().await;
            if !rooms.contains_key(name) {
                let room = DocumentRoom::new(self.config.broadcast_capacity);
                self.restore_snapshot(name, &room).await;
                rooms.insert(name.to_string(), room);
            }
            let room_count = rooms.len();
            let Some(room) = rooms.get_mut(name) else {
                return Ok(None);
            };

            if room.broadcast.peer_count().await >= self.config.max_peers_per_room {
                log::warn!(
                    "Room {name} is full ({} peers), rejecting {}",
                    self.config.max_peers_per_room,
                    info.name
                );
                drop(rooms);
                self.stats.write().await.rejected_peers += 1;
                return Ok(None);
            }

            let others = room.broadcast.peers().await;
            let rx = room.broadcast.add_peer(info.clone()).await;
            let awareness: Vec<Arc<Vec<u8>>> = room.awareness.values().cloned().collect();
            (rx, room.state_vector(), others, awareness, room.broadcast.clone(), room_count)
        };

        let step1 = SyncMessage::sync_step1(Uuid::nil(), name, sv);
        ws_sender.send(Message::Binary(step1.encode()?.into())).await?;
        for other in &others {
            let joined = SyncMessage::peer_joined(name, other)?;
            ws_sender.send(Message::Binary(joined.encode()?.into())).await?;
        }
        for frame in awareness {
            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
        }

        group.broadcast(&SyncMessage::peer_joined(name, info)?)?;
        self.stats.write().await.active_rooms = room_count;

        log::info!("Peer {} ({}) joined room {name}", info.name, info.peer_id);
        Ok(Some(rx))
    }

    async fn leave_room(&self, name: &str, info: &PeerInfo) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(name) else {
            return;
        };

        room.broadcast.remove_peer(&info.peer_id).await;
        room.awareness.remove(&info.peer_id);

        match SyncMessage::peer_left(name, info) {
            Ok(left) => {
                let _ = room.broadcast.broadcast(&left);
            }
            Err(e) => log::warn!("Failed to encode leave for {}: {e}", info.name),
        }
        let leave = AwarenessMessage::Leave {
            user_id: info.user_id.clone(),
        };
        match SyncMessage::awareness(info.peer_id, name, 0, &leave) {
            Ok(frame) => {
                let _ = room.broadcast.broadcast(&frame);
            }
            Err(e) => log::warn!("Failed to encode presence leave for {}: {e}", info.name),
        }
        log::info!("Peer {} left room {name}", info.name);

        if room.broadcast.peer_count().await == 0 {
            let snapshot = room.full_state();
            match self.snapshots.save(name, &snapshot).await {
                Ok(size) => {
                    self.stats.write().await.persisted_snapshots += 1;
                    log::info!("Archived room {name} ({size} bytes compressed)");
                }
                Err(e) => log::error!("Failed to archive room {name}: {e}"),
            }
            rooms.remove(name);
            log::info!("Room {name} closed (empty)");
        }
        self.stats.write().await.active_rooms = rooms.len();
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Full state of an open room, if it is open.
    pub async fn room_state(&self, name: &str) -> Option<Vec<u8>> {
        self.rooms.read().await.get(name).map(DocumentRoom::full_state)
    }

    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
