//! WebSocket relay client.
//!
//! Provides:
//! - Connection lifecycle (connect, idempotent disconnect)
//! - Delta send with a bounded offline queue replayed on connect
//! - Awareness sends, dropped while offline
//! - Sync steps against the room's authoritative document
//!
//! Everything received is surfaced as [`SyncEvent`]s on one channel.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::AwarenessMessage;
use crate::error::TransportError;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

pub const DEFAULT_OFFLINE_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    /// Connection lost (not emitted for an explicit `disconnect`)
    Disconnected,
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// The relay sent its state vector; answer with what it lacks.
    SyncRequested(Vec<u8>),
    /// Diff from the relay in answer to `request_sync`.
    StateSynced(Vec<u8>),
    RemoteAwareness {
        peer_id: Uuid,
        message: AwarenessMessage,
    },
    PeerJoined(PeerInfo),
    PeerLeft(PeerInfo),
}

/// Deltas produced while disconnected, replayed in order on connect.
pub struct OfflineQueue {
    queue: VecDeque<(u64, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta. Returns `false` when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, payload));
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, payload)| payload.len()).sum()
    }
}

/// Relay connection for one room.
pub struct SyncClient {
    peer_info: PeerInfo,
    room: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Lamport clock for causal ordering
    clock: Arc<RwLock<u64>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    reader: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, room: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self::with_queue_capacity(peer_info, room, server_url, DEFAULT_OFFLINE_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(
        peer_info: PeerInfo,
        room: impl Into<String>,
        server_url: impl Into<String>,
        queue_capacity: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            room: room.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(queue_capacity))),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            reader: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the room and replay queued deltas.
    ///
    /// Spawns a writer task fed by an internal channel and a reader task
    /// that turns frames into [`SyncEvent`]s.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if *self.state.read().await == ConnectionState::Connected {
            return Ok(());
        }
        self.stop_tasks();
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Relay connect to {} failed: {e}", self.server_url);
                return Err(TransportError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer: forward the outgoing channel; a closed channel closes the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let join = SyncMessage::peer_joined(&self.room, &self.peer_info)?.encode()?;
        out_tx
            .send(join)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued deltas", queued.len());
        }
        for (clock, payload) in queued {
            let frame = SyncMessage::delta(self.peer_info.peer_id, &self.room, clock, payload).encode()?;
            out_tx
                .send(frame)
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
        }

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to relay {} room {}", self.server_url, self.room);

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_info.peer_id;
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match SyncMessage::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Dropping undecodable relay frame: {e}");
                                continue;
                            }
                        };
                        if frame.peer_id == peer_id {
                            continue;
                        }
                        if let Some(event) = frame_to_event(frame) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            log::info!("Relay connection lost");
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        Ok(())
    }

    /// Close the connection. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        let was = std::mem::replace(&mut *self.state.write().await, ConnectionState::Disconnected);
        self.stop_tasks();
        if was != ConnectionState::Disconnected {
            log::info!("Disconnected from relay room {}", self.room);
        }
    }

    fn stop_tasks(&mut self) {
        // Dropping the sender lets the writer send Close and exit.
        self.outgoing_tx = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Send a CRDT delta, queueing it while offline.
    pub async fn send_delta(&self, yrs_update: Vec<u8>) -> Result<(), TransportError> {
        let current_clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };

        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(current_clock, yrs_update) {
                log::warn!("Offline queue full, dropping delta");
                return Err(TransportError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::delta(self.peer_info.peer_id, &self.room, current_clock, yrs_update);
        self.send_frame(msg.encode()?).await
    }

    /// Send a presence frame. Dropped silently while offline.
    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), TransportError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let clock = *self.clock.read().await;
        let msg = SyncMessage::awareness(self.peer_info.peer_id, &self.room, clock, message)?;
        self.send_frame(msg.encode()?).await
    }

    /// Ask the relay for everything missing from `state_vector`.
    pub async fn request_sync(&self, state_vector: Vec<u8>) -> Result<(), TransportError> {
        let msg = SyncMessage::sync_step1(self.peer_info.peer_id, &self.room, state_vector);
        self.send_frame(msg.encode()?).await
    }

    pub async fn send_ping(&self) -> Result<(), TransportError> {
        self.send_frame(SyncMessage::ping(self.peer_info.peer_id).encode()?).await
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(frame).await.map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

fn frame_to_event(frame: SyncMessage) -> Option<SyncEvent> {
    let result: Result<Option<SyncEvent>, ProtocolError> = match frame.msg_type {
        MessageType::Delta => Ok(Some(SyncEvent::RemoteDelta {
            peer_id: frame.peer_id,
            clock: frame.clock,
            update: frame.payload,
        })),
        MessageType::SyncStep1 => Ok(Some(SyncEvent::SyncRequested(frame.payload))),
        MessageType::SyncStep2 => Ok(Some(SyncEvent::StateSynced(frame.payload))),
        MessageType::Awareness => frame.awareness_message().map(|message| {
            Some(SyncEvent::RemoteAwareness {
                peer_id: frame.peer_id,
                message,
            })
        }),
        MessageType::PeerJoined => frame.peer_info().map(|info| Some(SyncEvent::PeerJoined(info))),
        MessageType::PeerLeft => frame.peer_info().map(|info| Some(SyncEvent::PeerLeft(info))),
        MessageType::Ping | MessageType::Pong => {
            log::trace!("{:?} from relay", frame.msg_type);
            Ok(None)
        }
    };

    result.unwrap_or_else(|e| {
        log::warn!("Dropping malformed relay frame: {e}");
        None
    })
}
