//! Session orchestration: one coordinator per user per room.
//!
//! ```text
//!   render events ──┐                       ┌──► RenderTarget
//!   relay events  ──┼──► SyncCoordinator ───┼──► SharedDocumentStore ──► relay delta
//!   mesh links    ──┤    (single task)      ├──► PeerMesh (drawing preview, chat)
//!   timer ticks   ──┘                       └──► CollabEvent channel
//! ```
//!
//! The store is the only authority. The mesh delivers drawing operations
//! early as a preview; the relay delivers them again inside store deltas.
//! Both paths pass through one [`RecentlySeen`] set, so every point is
//! drawn exactly once.
//!
//! All state is owned by the task driving [`SyncCoordinator::run`]. Timers
//! are deadlines folded into the same `select!`, so cancelling one is just
//! clearing it.

mod background;
mod debounce;
mod objects;
mod strokes;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use inkboard_core::{
    now_millis, BackgroundState, BackgroundTransform, BrushDefaults, DrawingOperation, ObjectId,
    ObjectKind, ObjectUpdate, OperationId, OperationKind, OperationSequence, SharedDocumentStore,
    Size, StoreChanges, UserId,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub use background::BackgroundSync;
pub use debounce::Debounce;
pub use objects::reconcile_objects;
pub use strokes::{connect_threshold, StrokeTracker, MIN_CONNECT_DISTANCE};

use crate::awareness::{AwarenessChannel, AwarenessEvent, AwarenessMessage, CursorPosition, UserInfo};
use crate::client::{SyncClient, SyncEvent};
use crate::config::CollabConfig;
use crate::dedupe::RecentlySeen;
use crate::error::{ApplyError, CollabError, InitializationError, TransportError};
use crate::mesh::{
    Envelope, EnvelopeKind, FileShare, IceCandidate, LinkEvent, MediaDevices, MeshEvent,
    PeerConnector, PeerMesh, SessionDescription,
};
use crate::protocol::PeerInfo;
use crate::render::{RenderEvent, RenderTarget, ShapeGeometry};

pub const DEFAULT_FONT_SIZE: f64 = 16.0;

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    /// Local content settled after an edit
    ContentChanged,
    UserJoined(UserId),
    UserLeft(UserId),
    Chat { from: UserId, text: String },
    FileShared { from: UserId, file: FileShare },
    RelayConnected,
    RelayDisconnected,
    MeshPeerConnected(UserId),
    MeshPeerLeft(UserId),
}

#[derive(Debug, Clone, PartialEq)]
struct Brush {
    size: f64,
    color: String,
    erase: bool,
}

impl From<BrushDefaults> for Brush {
    fn from(defaults: BrushDefaults) -> Self {
        Self {
            size: defaults.size,
            color: defaults.color,
            erase: false,
        }
    }
}

enum Input {
    Relay(SyncEvent),
    Link(LinkEvent),
    Render(RenderEvent),
    Tick,
}

pub struct SyncCoordinator<R: RenderTarget> {
    config: CollabConfig,
    local: UserInfo,
    store: SharedDocumentStore,
    sequence: OperationSequence,
    awareness: AwarenessChannel,
    seen: RecentlySeen,
    strokes: StrokeTracker,
    background: BackgroundSync,

    relay: SyncClient,
    relay_events: Option<mpsc::Receiver<SyncEvent>>,
    mesh: PeerMesh,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    media: Option<Arc<dyn MediaDevices>>,
    render: R,
    render_events: Option<mpsc::UnboundedReceiver<RenderEvent>>,

    events_tx: mpsc::UnboundedSender<CollabEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<CollabEvent>>,

    /// Remote operations received before the target was ready, FIFO
    pending: VecDeque<DrawingOperation>,
    ready: bool,
    disconnected: bool,
    brush: Brush,
    drawing: bool,
    content_changed: Debounce,
    next_cleanup: Instant,
    reconnect_at: Option<Instant>,
}

impl<R: RenderTarget> SyncCoordinator<R> {
    /// Wire up every collaborator. Nothing touches the network until
    /// [`initialize`](Self::initialize).
    pub fn new(
        config: CollabConfig,
        local_user: UserInfo,
        render: R,
        connector: Arc<dyn PeerConnector>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        let peer_info = PeerInfo::new(local_user.id.clone(), local_user.name.clone());
        let mut relay = SyncClient::with_queue_capacity(
            peer_info,
            config.room.clone(),
            config.server_url.clone(),
            config.offline_queue_capacity,
        );
        let relay_events = relay.take_event_rx();
        let awareness = AwarenessChannel::with_timings(
            local_user.clone(),
            config.awareness_throttle(),
            config.stale_after_ms,
            config.evict_after_ms,
        );
        let mesh = PeerMesh::new(local_user.id.clone(), connector, config.data_channel.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            store: SharedDocumentStore::new(),
            sequence: OperationSequence::new(local_user.id.clone()),
            awareness,
            seen: RecentlySeen::new(config.dedupe_capacity),
            strokes: StrokeTracker::new(),
            background: BackgroundSync::new(config.background_debounce()),
            relay,
            relay_events,
            mesh,
            link_events: Some(link_events),
            media: None,
            render,
            render_events: None,
            events_tx,
            events_rx: Some(events_rx),
            pending: VecDeque::new(),
            ready: false,
            disconnected: false,
            brush: Brush::from(BrushDefaults::default()),
            drawing: false,
            content_changed: Debounce::new(config.content_debounce()),
            next_cleanup: Instant::now() + config.cleanup_interval(),
            reconnect_at: None,
            local: local_user,
            config,
        }
    }

    /// Acquire local media during `initialize`.
    pub fn with_media(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.media = Some(devices);
        self
    }

    /// Application event channel (can only be taken once).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CollabEvent>> {
        self.events_rx.take()
    }

    /// Bring the session up.
    ///
    /// Only a render target that never becomes ready is fatal. A relay
    /// that cannot be reached leaves the session offline with reconnects
    /// scheduled; missing media is ignored.
    pub async fn initialize(&mut self) -> Result<(), CollabError> {
        if !self.render.is_ready() {
            let limit = self.config.init_timeout();
            match tokio::time::timeout(limit, self.render.wait_for_initialization()).await {
                Err(_) => return Err(InitializationError::Timeout(limit).into()),
                Ok(Err(e)) => return Err(InitializationError::Render(e).into()),
                Ok(Ok(())) => {}
            }
        }
        self.render_events = self.render.take_events();
        self.disconnected = false;

        if let Some(devices) = self.media.clone() {
            self.mesh.acquire_media(devices.as_ref()).await;
        }

        self.connect_relay().await;

        let rendered = self.project_store();
        self.ready = true;
        self.replay_pending(&rendered);

        log::info!(
            "Session ready for {} in room {} ({} operations, {} objects)",
            self.local.id,
            self.config.room,
            self.store.operation_count(),
            self.store.all_objects().len()
        );
        Ok(())
    }

    /// Drive the session until `shutdown` resolves, then disconnect.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                input = self.next_input() => self.dispatch(input).await,
            }
        }
        self.disconnect().await;
    }

    /// Wait for and handle exactly one input.
    pub async fn step(&mut self) {
        let input = self.next_input().await;
        self.dispatch(input).await;
    }

    /// Leave the session. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.ready = false;
        self.drawing = false;

        self.background.cancel();
        self.content_changed.cancel();
        self.reconnect_at = None;

        let leave = self.awareness.leave_message();
        if let Err(e) = self.relay.send_awareness(&leave).await {
            log::warn!("Failed to announce leave on relay: {e}");
        }
        match Envelope::awareness(&leave) {
            Ok(envelope) => {
                self.mesh.broadcast(&envelope);
            }
            Err(e) => log::warn!("Failed to encode leave: {e}"),
        }

        self.mesh.close_all();
        self.relay.disconnect().await;
        self.render.release();
        log::info!("{} left room {}", self.local.id, self.config.room);
    }

    // ── Local drawing ───────────────────────────────────────────

    pub async fn start_drawing(&mut self, x: f64, y: f64, size: f64, color: &str) {
        self.brush.size = size;
        self.brush.color = color.to_string();
        self.drawing = true;

        let update = self.awareness.update_current_user_drawing(true, Instant::now());
        self.publish_awareness(update).await;
        self.draw_point(x, y).await;
    }

    pub async fn continue_drawing(&mut self, x: f64, y: f64) {
        if self.drawing {
            self.draw_point(x, y).await;
        }
    }

    pub async fn end_drawing(&mut self) {
        if !self.drawing {
            return;
        }
        self.drawing = false;
        let update = self.awareness.update_current_user_drawing(false, Instant::now());
        self.publish_awareness(update).await;
        self.content_changed.schedule(Instant::now());
    }

    pub fn set_eraser(&mut self, erase: bool) {
        self.brush.erase = erase;
    }

    pub async fn update_cursor(&mut self, x: f64, y: f64) {
        let update = self
            .awareness
            .update_current_user_cursor(Some(CursorPosition { x, y }), Instant::now());
        self.publish_awareness(update).await;
    }

    pub async fn hide_cursor(&mut self) {
        let update = self.awareness.update_current_user_cursor(None, Instant::now());
        self.publish_awareness(update).await;
    }

    pub async fn update_selection(&mut self, selection: Vec<ObjectId>) {
        let update = self
            .awareness
            .update_current_user_selection(selection, Instant::now());
        self.publish_awareness(update).await;
    }

    pub async fn set_typing(&mut self, typing: bool) {
        let update = self.awareness.update_current_user_typing(typing, Instant::now());
        self.publish_awareness(update).await;
    }

    /// Wipe the drawing layer and every object for the whole room.
    pub async fn clear_canvas(&mut self) {
        let op = DrawingOperation::clear(self.sequence.next_id());
        self.record_local_operation(op).await;

        let delta = self.store.clear_objects();
        self.send_delta(delta).await;

        if self.ready {
            self.render.clear_drawing();
        }
        self.strokes.clear();
        self.after_local_object_change();
    }

    pub async fn set_brush_defaults(&mut self, size: f64, color: &str) {
        self.brush.size = size;
        self.brush.color = color.to_string();
        let delta = self.store.set_brush_defaults(size, color);
        self.send_delta(delta).await;
    }

    async fn draw_point(&mut self, x: f64, y: f64) {
        let kind = if self.brush.erase {
            OperationKind::Erase
        } else {
            OperationKind::Draw
        };
        let op = DrawingOperation::stroke(
            self.sequence.next_id(),
            kind,
            x,
            y,
            self.brush.size,
            self.brush.color.clone(),
        );
        self.record_local_operation(op).await;
    }

    /// Mesh first for latency, then the store (and its relay delta).
    async fn record_local_operation(&mut self, op: DrawingOperation) {
        self.seen.check_and_insert(&op.id);

        match Envelope::drawing(&op) {
            Ok(envelope) => {
                self.mesh.broadcast(&envelope);
            }
            Err(e) => log::warn!("Failed to encode operation {}: {e}", op.id),
        }

        match self.store.add_operation(&op) {
            Ok(delta) => self.send_delta(delta).await,
            Err(e) => log::error!("Failed to record operation {}: {e}", op.id),
        }
    }

    // ── Local objects ───────────────────────────────────────────

    pub async fn add_text(
        &mut self,
        x: f64,
        y: f64,
        text: &str,
        font_size: f64,
        color: &str,
    ) -> Option<ObjectId> {
        let kind = ObjectKind::Text {
            text: text.to_string(),
            font_size,
            color: color.to_string(),
        };
        self.create_object(x, y, kind).await
    }

    pub async fn add_shape(&mut self, shape: ShapeGeometry) -> Option<ObjectId> {
        let kind = ObjectKind::Shape {
            tool: shape.tool,
            x2: shape.x2,
            y2: shape.y2,
            brush_size: self.brush.size,
            color: self.brush.color.clone(),
        };
        self.create_object(shape.x, shape.y, kind).await
    }

    /// Decode the image through the target, then share it.
    pub async fn add_image(
        &mut self,
        data_url: &str,
        x: f64,
        y: f64,
        scale: f64,
    ) -> Result<ObjectId, CollabError> {
        let info = self.render.load_image_from_data_url(data_url).await?;
        let kind = ObjectKind::Image {
            data_url: data_url.to_string(),
            width: info.width,
            height: info.height,
            scale,
        };
        let (id, delta) = self.store.add_object(x, y, kind)?;
        self.send_delta(delta).await;
        self.after_local_object_change();
        Ok(id)
    }

    pub async fn move_object(&mut self, id: &ObjectId, x: f64, y: f64) {
        self.update_object_fields(id, &ObjectUpdate::position(x, y)).await;
    }

    pub async fn transform_object(&mut self, id: &ObjectId, update: &ObjectUpdate) {
        self.update_object_fields(id, update).await;
    }

    pub async fn remove_object(&mut self, id: &ObjectId) {
        let delta = self.store.remove_object(id);
        self.send_delta(delta).await;
        self.after_local_object_change();
    }

    async fn create_object(&mut self, x: f64, y: f64, kind: ObjectKind) -> Option<ObjectId> {
        match self.store.add_object(x, y, kind) {
            Ok((id, delta)) => {
                self.send_delta(delta).await;
                self.after_local_object_change();
                Some(id)
            }
            Err(e) => {
                log::error!("Failed to add object: {e}");
                None
            }
        }
    }

    async fn update_object_fields(&mut self, id: &ObjectId, update: &ObjectUpdate) {
        if update.is_empty() {
            return;
        }
        match self.store.update_object(id, update) {
            Ok(delta) => {
                self.send_delta(delta).await;
                self.after_local_object_change();
            }
            Err(e) => log::warn!("Ignoring update for object {id}: {e}"),
        }
    }

    fn after_local_object_change(&mut self) {
        if self.ready {
            self.reconcile_objects();
        }
        self.content_changed.schedule(Instant::now());
    }

    // ── Background ──────────────────────────────────────────────

    /// Debounced; see [`BackgroundSync`].
    pub fn set_background_scale(&mut self, scale: f64) {
        let current = self.store.background_state();
        self.background.stage_scale(current, scale, Instant::now());
    }

    /// Debounced; see [`BackgroundSync`].
    pub fn set_background_transform(&mut self, transform: BackgroundTransform) {
        let current = self.store.background_state();
        self.background.stage_transform(current, transform, Instant::now());
    }

    /// Decode and share a new background image. Written immediately.
    pub async fn load_background_image(&mut self, data_url: &str) -> Result<(), CollabError> {
        let info = self.render.load_image_from_data_url(data_url).await?;
        let state = BackgroundState::new(
            data_url,
            Size {
                width: info.width,
                height: info.height,
            },
        );
        self.background.cancel();
        self.write_background(Some(&state)).await;
        self.render.set_background_transform(Some(&state), false)?;
        Ok(())
    }

    pub async fn remove_background_image(&mut self) {
        self.background.cancel();
        self.write_background(None).await;
        if let Err(e) = self.render.set_background_transform(None, false) {
            log::warn!("Failed to clear background: {e}");
        }
    }

    pub async fn reset_background_transform(&mut self) {
        let base = self
            .background
            .pending()
            .cloned()
            .or_else(|| self.store.background_state());
        self.background.cancel();
        let Some(base) = base else {
            return;
        };

        let state = base.with_transform(BackgroundTransform::default());
        self.write_background(Some(&state)).await;
        if let Err(e) = self.render.set_background_transform(Some(&state), false) {
            log::warn!("Failed to reset background: {e}");
        }
    }

    async fn write_background(&mut self, state: Option<&BackgroundState>) {
        match self.store.set_background_state(state) {
            Ok(delta) => self.send_delta(delta).await,
            Err(e) => log::error!("Failed to store background: {e}"),
        }
    }

    // ── Chat, files, mesh signaling ─────────────────────────────

    pub fn send_chat(&mut self, text: &str) {
        let envelope = Envelope::chat(self.local.id.clone(), text);
        let sent = self.mesh.broadcast(&envelope);
        log::debug!("Chat message sent to {sent} peers");
    }

    pub fn share_file(&mut self, file: &FileShare) {
        match Envelope::file(self.local.id.clone(), file) {
            Ok(envelope) => {
                self.mesh.broadcast(&envelope);
            }
            Err(e) => log::warn!("Failed to encode file {}: {e}", file.name),
        }
    }

    pub async fn connect_peer(&mut self, peer: &UserId) -> Result<SessionDescription, TransportError> {
        self.mesh.connect_to(peer).await
    }

    pub async fn accept_peer_offer(
        &mut self,
        peer: &UserId,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.mesh.accept_offer(peer, offer).await
    }

    pub async fn accept_peer_answer(
        &mut self,
        peer: &UserId,
        answer: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.mesh.handle_answer(peer, answer).await
    }

    pub async fn add_ice_candidate(
        &mut self,
        peer: &UserId,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        self.mesh.handle_ice_candidate(peer, candidate).await
    }

    pub fn close_peer(&mut self, peer: &UserId) {
        self.mesh.close_peer(peer);
    }

    // ── Snapshots ───────────────────────────────────────────────

    pub fn export_canvas_state(&self) -> String {
        self.store.export_state()
    }

    /// Merge a snapshot into the room and redraw. Nothing changes when the
    /// snapshot is rejected.
    pub async fn import_canvas_state(&mut self, snapshot: &str) -> Result<(), CollabError> {
        let before = self.store.state_vector();
        let changes = self.store.import_state(snapshot)?;
        log::info!(
            "Imported canvas state with {} new operations",
            changes.operations.len()
        );

        match self.store.encode_diff(&before) {
            Ok(diff) => self.send_delta(diff).await,
            Err(e) => log::warn!("Failed to diff imported state: {e}"),
        }
        if self.ready {
            self.project_store();
        }
        self.content_changed.schedule(Instant::now());
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn local_user(&self) -> &UserInfo {
        &self.local
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedDocumentStore {
        &self.store
    }

    pub fn awareness(&self) -> &AwarenessChannel {
        &self.awareness
    }

    pub fn mesh(&self) -> &PeerMesh {
        &self.mesh
    }

    pub fn relay(&self) -> &SyncClient {
        &self.relay
    }

    pub fn render(&self) -> &R {
        &self.render
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    // ── Event loop ──────────────────────────────────────────────

    fn next_deadline(&self) -> Instant {
        [
            self.background.deadline(),
            self.content_changed.deadline(),
            self.awareness.next_flush_deadline(),
            self.reconnect_at,
        ]
        .into_iter()
        .flatten()
        .fold(self.next_cleanup, Instant::min)
    }

    async fn next_input(&mut self) -> Input {
        let deadline = self.next_deadline();
        tokio::select! {
            Some(event) = recv(&mut self.relay_events) => Input::Relay(event),
            Some(event) = recv_unbounded(&mut self.link_events) => Input::Link(event),
            Some(event) = recv_unbounded(&mut self.render_events) => Input::Render(event),
            _ = tokio::time::sleep_until(deadline) => Input::Tick,
        }
    }

    async fn dispatch(&mut self, input: Input) {
        match input {
            Input::Relay(event) => self.handle_relay_event(event).await,
            Input::Link(event) => self.handle_link_event(event),
            Input::Render(event) => self.handle_render_event(event).await,
            Input::Tick => self.handle_timers(Instant::now()).await,
        }
    }

    async fn handle_timers(&mut self, now: Instant) {
        if let Some(state) = self.background.take_due(now) {
            self.write_background(Some(&state)).await;
        }

        if self.content_changed.fire_if_due(now) {
            self.emit(CollabEvent::ContentChanged);
        }

        let trailing = self.awareness.flush_pending(now);
        self.publish_awareness(trailing).await;

        if now >= self.next_cleanup {
            self.next_cleanup = now + self.config.cleanup_interval();
            let events = self.awareness.cleanup_inactive_users(now_millis());
            self.apply_awareness_events(events);
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.connect_relay().await;
        }
    }

    async fn connect_relay(&mut self) {
        match self.relay.connect().await {
            Ok(()) => self.reconnect_at = None,
            Err(e) => {
                let retry = self.config.reconnect_interval();
                log::warn!("Relay unavailable ({e}), retrying in {retry:?}");
                self.reconnect_at = Some(Instant::now() + retry);
            }
        }
    }

    async fn handle_relay_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Connected => {
                self.reconnect_at = None;
                let state_vector = self.store.state_vector();
                if let Err(e) = self.relay.request_sync(state_vector).await {
                    log::warn!("Failed to request sync: {e}");
                }
                let hello = self.awareness.full_state_message();
                if let Err(e) = self.relay.send_awareness(&hello).await {
                    log::warn!("Failed to announce presence: {e}");
                }
                self.emit(CollabEvent::RelayConnected);
            }
            SyncEvent::Disconnected => {
                self.emit(CollabEvent::RelayDisconnected);
                if !self.disconnected {
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_interval());
                }
            }
            SyncEvent::SyncRequested(state_vector) => match self.store.encode_diff(&state_vector) {
                Ok(diff) => self.send_delta(diff).await,
                Err(e) => log::warn!("Ignoring malformed state vector: {e}"),
            },
            SyncEvent::StateSynced(update) | SyncEvent::RemoteDelta { update, .. } => {
                self.apply_store_update(&update);
            }
            SyncEvent::RemoteAwareness { message, .. } => self.handle_awareness_message(&message),
            SyncEvent::PeerJoined(info) => {
                log::debug!("{} ({}) joined room {}", info.name, info.user_id, self.config.room);
            }
            SyncEvent::PeerLeft(info) => {
                log::debug!("{} ({}) left room {}", info.name, info.user_id, self.config.room);
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match self.mesh.handle_link_event(event) {
            Some(MeshEvent::PeerConnected(peer)) => {
                let hello = self.awareness.full_state_message();
                match Envelope::awareness(&hello) {
                    Ok(envelope) => {
                        if let Err(e) = self.mesh.send_to(&peer, &envelope) {
                            log::warn!("Failed to greet {peer}: {e}");
                        }
                    }
                    Err(e) => log::warn!("Failed to encode presence: {e}"),
                }
                self.emit(CollabEvent::MeshPeerConnected(peer));
            }
            Some(MeshEvent::PeerLeft(peer)) => self.emit(CollabEvent::MeshPeerLeft(peer)),
            Some(MeshEvent::Envelope { from, envelope }) => self.handle_envelope(from, envelope),
            None => {}
        }
    }

    async fn handle_render_event(&mut self, event: RenderEvent) {
        match event {
            RenderEvent::DrawStart { x, y } => {
                let color = self.brush.color.clone();
                self.start_drawing(x, y, self.brush.size, &color).await;
            }
            RenderEvent::DrawContinue { x, y } => self.continue_drawing(x, y).await,
            RenderEvent::DrawEnd => self.end_drawing().await,
            RenderEvent::PointerMove { x, y } => self.update_cursor(x, y).await,
            RenderEvent::TextInput { x, y, text } => {
                let color = self.brush.color.clone();
                self.add_text(x, y, &text, DEFAULT_FONT_SIZE, &color).await;
            }
            RenderEvent::ShapeComplete(shape) => {
                self.add_shape(shape).await;
            }
            RenderEvent::ObjectMoved { id, x, y } => self.move_object(&id, x, y).await,
            RenderEvent::ObjectTransformed { id, update } => {
                self.transform_object(&id, &update).await;
            }
            RenderEvent::BackgroundScaleChange(scale) => self.set_background_scale(scale),
            RenderEvent::BackgroundTransformChange(transform) => {
                self.set_background_transform(transform);
            }
        }
    }

    // ── Remote state ────────────────────────────────────────────

    fn apply_store_update(&mut self, update: &[u8]) {
        match self.store.apply_update(update) {
            Ok(changes) => self.handle_store_changes(changes),
            Err(e) => log::warn!("Rejected relay update: {e}"),
        }
    }

    fn handle_store_changes(&mut self, changes: StoreChanges) {
        for op in changes.operations {
            self.receive_remote_operation(op);
        }
        if changes.settings_changed {
            self.brush = Brush {
                erase: self.brush.erase,
                ..Brush::from(self.store.brush_defaults())
            };
        }
        if !self.ready {
            return;
        }
        if changes.objects_changed {
            self.reconcile_objects();
        }
        if changes.background_changed {
            self.show_background();
        }
    }

    fn handle_envelope(&mut self, from: UserId, envelope: Envelope) {
        if envelope.user_id != from {
            log::warn!("Dropping envelope from {from} claiming to be {}", envelope.user_id);
            return;
        }
        match envelope.kind {
            EnvelopeKind::Drawing => match envelope.drawing_operation() {
                Ok(op) if *op.user_id() == from => self.receive_remote_operation(op),
                Ok(op) => log::warn!("Dropping operation {} relayed by {from}", op.id),
                Err(e) => log::warn!("Bad drawing envelope from {from}: {e}"),
            },
            EnvelopeKind::Awareness => match envelope.awareness_message() {
                Ok(message) if *message.user_id() == from => self.handle_awareness_message(&message),
                Ok(_) => log::warn!("Dropping presence relayed by {from}"),
                Err(e) => log::warn!("Bad awareness envelope from {from}: {e}"),
            },
            EnvelopeKind::Chat => match envelope.chat_text() {
                Ok(text) => self.emit(CollabEvent::Chat { from, text }),
                Err(e) => log::warn!("Bad chat envelope from {from}: {e}"),
            },
            EnvelopeKind::File => match envelope.file_share() {
                Ok(file) => self.emit(CollabEvent::FileShared { from, file }),
                Err(e) => log::warn!("Bad file envelope from {from}: {e}"),
            },
        }
    }

    /// Single entry for remote operations from either transport.
    ///
    /// Operations written by this session are already in `seen`; ones the
    /// same user wrote in an earlier session are drawn like anyone else's.
    fn receive_remote_operation(&mut self, op: DrawingOperation) {
        if !self.seen.check_and_insert(&op.id) {
            log::trace!("Skipping duplicate operation {}", op.id);
            return;
        }
        if !self.ready {
            self.pending.push_back(op);
            return;
        }
        self.render_operation(&op);
    }

    fn render_operation(&mut self, op: &DrawingOperation) {
        match op.kind {
            OperationKind::Clear => {
                self.render.clear_drawing();
                self.strokes.clear();
            }
            OperationKind::Draw | OperationKind::Erase => {
                let segment = self.strokes.segment(op);
                if let Err(source) = self.render.apply_remote_drawing(op.user_id(), &segment) {
                    let err = ApplyError::Drawing {
                        user: op.user_id().clone(),
                        source,
                    };
                    log::error!("{err}");
                }
            }
        }
    }

    /// Redraw the target from the store. Returns the operations drawn.
    fn project_store(&mut self) -> HashSet<OperationId> {
        self.render.clear_drawing();
        self.strokes.clear();

        let operations = self.store.all_operations();
        let mut rendered = HashSet::with_capacity(operations.len());
        for op in &operations {
            self.seen.check_and_insert(&op.id);
            self.render_operation(op);
            rendered.insert(op.id.clone());
        }

        self.reconcile_objects();
        self.show_background();
        rendered
    }

    fn replay_pending(&mut self, rendered: &HashSet<OperationId>) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            log::debug!("Replaying {} operations received before ready", pending.len());
        }
        for op in pending.iter().filter(|op| !rendered.contains(&op.id)) {
            self.render_operation(op);
        }
    }

    fn reconcile_objects(&mut self) {
        let objects = self.store.all_objects();
        reconcile_objects(&objects, &mut self.render);
    }

    fn show_background(&mut self) {
        let state = self.store.background_state();
        if let Err(e) = self.background.apply_remote(state.as_ref(), &mut self.render) {
            log::error!("{e}");
        }
    }

    // ── Presence ────────────────────────────────────────────────

    fn handle_awareness_message(&mut self, message: &AwarenessMessage) {
        let events = self.awareness.handle_message(message, now_millis());
        self.apply_awareness_events(events);
    }

    fn apply_awareness_events(&mut self, events: Vec<AwarenessEvent>) {
        for event in events {
            match event {
                AwarenessEvent::Joined(user) => {
                    self.show_cursor(&user);
                    self.emit(CollabEvent::UserJoined(user));
                }
                AwarenessEvent::Updated(user) => self.show_cursor(&user),
                AwarenessEvent::DrawingStopped(user) => {
                    self.strokes.reset(&user);
                    if self.ready {
                        self.render.reset_remote_path(&user);
                    }
                }
                AwarenessEvent::Left(user) => {
                    self.strokes.reset(&user);
                    if self.ready {
                        self.render.hide_remote_cursor(&user);
                    }
                    self.emit(CollabEvent::UserLeft(user));
                }
            }
        }
    }

    fn show_cursor(&mut self, user: &UserId) {
        if !self.ready {
            return;
        }
        let Some(state) = self.awareness.user(user) else {
            return;
        };
        match state.cursor {
            Some(cursor) => self
                .render
                .update_remote_cursor(user, cursor.x, cursor.y, &state.user.color),
            None => self.render.hide_remote_cursor(user),
        }
    }

    async fn publish_awareness(&mut self, message: Option<AwarenessMessage>) {
        let Some(message) = message else {
            return;
        };
        if let Err(e) = self.relay.send_awareness(&message).await {
            log::debug!("Presence not sent to relay: {e}");
        }
        match Envelope::awareness(&message) {
            Ok(envelope) => {
                self.mesh.broadcast(&envelope);
            }
            Err(e) => log::warn!("Failed to encode presence: {e}"),
        }
    }

    // ── Plumbing ────────────────────────────────────────────────

    async fn send_delta(&mut self, delta: Vec<u8>) {
        if let Err(e) = self.relay.send_delta(delta).await {
            log::warn!("Delta not sent to relay: {e}");
        }
    }

    fn emit(&self, event: CollabEvent) {
        let _ = self.events_tx.send(event);
    }
}

async fn recv<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_unbounded<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::mesh::MemoryNetwork;
    use crate::render::{ImageInfo, StrokeSegment};
    use crate::BoxFuture;
    use inkboard_core::{CanvasObject, ObjectTransform};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        segments: Vec<(UserId, StrokeSegment)>,
        clears: usize,
        cursors: BTreeMap<UserId, (f64, f64)>,
        path_resets: Vec<UserId>,
        objects: BTreeMap<ObjectId, CanvasObject>,
        background: Option<BackgroundState>,
        background_sets: usize,
        releases: usize,
    }

    struct Recorder {
        state: Arc<Mutex<Recorded>>,
        never_ready: bool,
        /// Waiting never resolves, even though the target reports ready.
        stall_wait: bool,
    }

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Recorded>>) {
            let state = Arc::new(Mutex::new(Recorded::default()));
            let recorder = Self {
                state: state.clone(),
                never_ready: false,
                stall_wait: false,
            };
            (recorder, state)
        }
    }

    impl RenderTarget for Recorder {
        fn is_ready(&self) -> bool {
            !self.never_ready
        }
        fn wait_for_initialization(&mut self) -> BoxFuture<'_, Result<(), RenderError>> {
            let never = self.never_ready || self.stall_wait;
            Box::pin(async move {
                if never {
                    std::future::pending::<()>().await;
                }
                Ok(())
            })
        }
        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RenderEvent>> {
            None
        }
        fn apply_remote_drawing(&mut self, user: &UserId, segment: &StrokeSegment) -> Result<(), RenderError> {
            self.state.lock().unwrap().segments.push((user.clone(), segment.clone()));
            Ok(())
        }
        fn clear_drawing(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.segments.clear();
            state.clears += 1;
        }
        fn update_remote_cursor(&mut self, user: &UserId, x: f64, y: f64, _color: &str) {
            self.state.lock().unwrap().cursors.insert(user.clone(), (x, y));
        }
        fn hide_remote_cursor(&mut self, user: &UserId) {
            self.state.lock().unwrap().cursors.remove(user);
        }
        fn reset_remote_path(&mut self, user: &UserId) {
            self.state.lock().unwrap().path_resets.push(user.clone());
        }
        fn object_ids(&self) -> Vec<ObjectId> {
            self.state.lock().unwrap().objects.keys().cloned().collect()
        }
        fn add_object(&mut self, object: &CanvasObject) -> Result<(), RenderError> {
            self.state.lock().unwrap().objects.insert(object.id.clone(), object.clone());
            Ok(())
        }
        fn update_object(&mut self, id: &ObjectId, transform: ObjectTransform) -> Result<(), RenderError> {
            if let Some(object) = self.state.lock().unwrap().objects.get_mut(id) {
                object.x = transform.x;
                object.y = transform.y;
            }
            Ok(())
        }
        fn remove_object(&mut self, id: &ObjectId) {
            self.state.lock().unwrap().objects.remove(id);
        }
        fn background_state(&self) -> Option<BackgroundState> {
            self.state.lock().unwrap().background.clone()
        }
        fn set_background_transform(&mut self, state: Option<&BackgroundState>, _notify: bool) -> Result<(), RenderError> {
            let mut recorded = self.state.lock().unwrap();
            recorded.background = state.cloned();
            recorded.background_sets += 1;
            Ok(())
        }
        fn load_image_from_data_url(&mut self, _data_url: &str) -> BoxFuture<'_, Result<ImageInfo, RenderError>> {
            Box::pin(async { Ok(ImageInfo { width: 640.0, height: 480.0 }) })
        }
        fn release(&mut self) {
            self.state.lock().unwrap().releases += 1;
        }
    }

    fn offline_config() -> CollabConfig {
        CollabConfig {
            // Nothing listens here; the relay stays offline.
            server_url: "ws://127.0.0.1:9".into(),
            room: "r1".into(),
            ..CollabConfig::default()
        }
    }

    fn coordinator(user: &str) -> (SyncCoordinator<Recorder>, Arc<Mutex<Recorded>>) {
        let network = MemoryNetwork::new();
        let (connector, links) = network.connector(UserId::from(user));
        let (render, recorded) = Recorder::new();
        let local = UserInfo::new(UserId::from(user), user);
        let coordinator = SyncCoordinator::new(offline_config(), local, render, Arc::new(connector), links);
        (coordinator, recorded)
    }

    fn op(user: &str, seq: u64, x: f64, y: f64) -> DrawingOperation {
        DrawingOperation::stroke(
            OperationId::new(UserId::from(user), 1_000 + seq, seq),
            OperationKind::Draw,
            x,
            y,
            5.0,
            "#ff0000",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_burst_writes_once() {
        let (mut coord, _) = coordinator("alice");

        coord.load_background_image("data:image/png;base64,AAAA").await.unwrap();
        assert_eq!(coord.relay().offline_queue_len().await, 1);

        for scale in [1.1, 1.2, 1.3, 1.4, 1.5] {
            coord.set_background_scale(scale);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(coord.relay().offline_queue_len().await, 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        coord.step().await;
        assert_eq!(coord.relay().offline_queue_len().await, 2);
        assert_eq!(coord.store().background_state().unwrap().scale, 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_background_flushes_immediately() {
        let (mut coord, _) = coordinator("alice");
        coord.load_background_image("data:image/png;base64,AAAA").await.unwrap();
        coord.set_background_scale(2.0);

        coord.remove_background_image().await;
        assert_eq!(coord.relay().offline_queue_len().await, 2);
        assert!(coord.store().background_state().is_none());
        assert!(coord.background.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout_is_fatal() {
        let network = MemoryNetwork::new();
        let (connector, links) = network.connector(UserId::from("alice"));
        let (mut render, _) = Recorder::new();
        render.never_ready = true;
        let config = CollabConfig {
            init_timeout_ms: 50,
            ..offline_config()
        };
        let local = UserInfo::new(UserId::from("alice"), "Alice");
        let mut coord = SyncCoordinator::new(config, local, render, Arc::new(connector), links);

        let err = coord.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            CollabError::Initialization(InitializationError::Timeout(_))
        ));
        assert!(!coord.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_target_not_waited_on() {
        let network = MemoryNetwork::new();
        let (connector, links) = network.connector(UserId::from("alice"));
        let (mut render, _) = Recorder::new();
        render.stall_wait = true;
        let local = UserInfo::new(UserId::from("alice"), "Alice");
        let mut coord = SyncCoordinator::new(offline_config(), local, render, Arc::new(connector), links);

        coord.initialize().await.unwrap();
        assert!(coord.is_ready());
    }

    #[tokio::test]
    async fn test_background_already_shown_not_reapplied() {
        let (mut coord, recorded) = coordinator("bob");
        coord.initialize().await.unwrap();
        let sets_after_init = recorded.lock().unwrap().background_sets;

        let mut alice = SharedDocumentStore::new();
        let state = BackgroundState::new("data:image/png;base64,AAAA", inkboard_core::Size { width: 4.0, height: 3.0 });
        let delta = alice.set_background_state(Some(&state)).unwrap();
        coord.apply_store_update(&delta);
        assert_eq!(recorded.lock().unwrap().background_sets, sets_after_init + 1);

        coord.show_background();
        assert_eq!(recorded.lock().unwrap().background_sets, sets_after_init + 1);
        assert_eq!(recorded.lock().unwrap().background, Some(state));
    }

    #[tokio::test]
    async fn test_coordinator_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (mut coord, _) = coordinator("alice");
        assert_send(&coord);
        assert_send(&coord.run(std::future::ready(())));
    }

    #[tokio::test]
    async fn test_operations_before_ready_replayed_in_order() {
        let (mut coord, recorded) = coordinator("bob");
        for (seq, (x, y)) in [(10.0, 10.0), (12.0, 11.0)].into_iter().enumerate() {
            let envelope = Envelope::drawing(&op("alice", seq as u64, x, y)).unwrap();
            coord.handle_envelope(UserId::from("alice"), envelope);
        }
        assert!(recorded.lock().unwrap().segments.is_empty());

        coord.initialize().await.unwrap();
        let state = recorded.lock().unwrap();
        assert_eq!(state.segments.len(), 2);
        assert!(state.segments[0].1.from.is_none());
        assert_eq!(state.segments[1].1.to.x, 12.0);
        assert!(state.segments[1].1.from.is_some());
    }

    #[tokio::test]
    async fn test_same_operation_over_both_transports_drawn_once() {
        let (mut coord, recorded) = coordinator("bob");
        coord.initialize().await.unwrap();

        let point = op("alice", 0, 5.0, 5.0);
        coord.handle_envelope(UserId::from("alice"), Envelope::drawing(&point).unwrap());

        let mut alice_store = SharedDocumentStore::new();
        let delta = alice_store.add_operation(&point).unwrap();
        coord.apply_store_update(&delta);

        assert_eq!(recorded.lock().unwrap().segments.len(), 1);
        assert_eq!(coord.store().operation_count(), 1);
    }

    #[tokio::test]
    async fn test_session_echo_not_redrawn() {
        let (mut coord, recorded) = coordinator("alice");
        coord.initialize().await.unwrap();
        coord.start_drawing(1.0, 1.0, 5.0, "#ff0000").await;
        coord.end_drawing().await;
        let own = coord.store().all_operations();
        assert_eq!(own.len(), 1);

        let mut relay_copy = SharedDocumentStore::new();
        let delta = relay_copy.add_operation(&own[0]).unwrap();
        coord.apply_store_update(&delta);
        coord.handle_envelope(UserId::from("alice"), Envelope::drawing(&own[0]).unwrap());
        assert!(recorded.lock().unwrap().segments.is_empty());
    }

    #[tokio::test]
    async fn test_rejoined_user_sees_own_strokes() {
        let (mut coord, recorded) = coordinator("alice");
        coord.initialize().await.unwrap();

        // Room history written by alice from an earlier session.
        let mut earlier = SharedDocumentStore::new();
        earlier.add_operation(&op("alice", 0, 1.0, 1.0)).unwrap();
        earlier.add_operation(&op("alice", 1, 4.0, 5.0)).unwrap();
        let history = earlier.encode_state();
        coord.apply_store_update(&history);

        let state = recorded.lock().unwrap();
        assert_eq!(state.segments.len(), 2);
        assert!(state.segments.iter().all(|(user, _)| user.as_str() == "alice"));
    }

    #[tokio::test]
    async fn test_spoofed_mesh_operation_dropped() {
        let (mut coord, recorded) = coordinator("bob");
        coord.initialize().await.unwrap();

        let forged = Envelope::drawing(&op("carol", 0, 1.0, 1.0)).unwrap();
        coord.handle_envelope(UserId::from("mallory"), forged.clone());
        assert!(recorded.lock().unwrap().segments.is_empty());

        // Envelope rewritten to match the link, operation still names carol.
        let relabeled = Envelope {
            user_id: UserId::from("mallory"),
            ..forged
        };
        coord.handle_envelope(UserId::from("mallory"), relabeled);
        assert!(recorded.lock().unwrap().segments.is_empty());
    }

    #[tokio::test]
    async fn test_drawing_stopped_resets_path() {
        let (mut coord, recorded) = coordinator("bob");
        coord.initialize().await.unwrap();
        let alice = UserId::from("alice");
        let drawing = |on| AwarenessMessage::Update {
            user_id: alice.clone(),
            update: crate::awareness::AwarenessUpdate {
                is_drawing: Some(on),
                cursor: Some(Some(CursorPosition { x: 3.0, y: 4.0 })),
                ..Default::default()
            },
        };

        coord.handle_awareness_message(&drawing(true));
        coord.receive_remote_operation(op("alice", 0, 0.0, 0.0));
        coord.handle_awareness_message(&drawing(false));
        coord.receive_remote_operation(op("alice", 1, 1.0, 1.0));

        let state = recorded.lock().unwrap();
        assert_eq!(state.path_resets, vec![alice.clone()]);
        assert_eq!(state.cursors.get(&alice), Some(&(3.0, 4.0)));
        assert!(state.segments[1].1.from.is_none());
    }

    #[tokio::test]
    async fn test_remote_clear_resets_drawing() {
        let (mut coord, recorded) = coordinator("bob");
        coord.initialize().await.unwrap();
        coord.receive_remote_operation(op("alice", 0, 0.0, 0.0));
        let clear = DrawingOperation::clear(OperationId::new(UserId::from("alice"), 2_000, 1));
        coord.receive_remote_operation(clear);

        let state = recorded.lock().unwrap();
        assert!(state.segments.is_empty());
        assert!(state.clears >= 2);
    }

    #[tokio::test]
    async fn test_local_objects_projected() {
        let (mut coord, recorded) = coordinator("alice");
        coord.initialize().await.unwrap();

        let id = coord.add_text(1.0, 2.0, "hello", 14.0, "#000").await.unwrap();
        coord.move_object(&id, 30.0, 40.0).await;
        {
            let state = recorded.lock().unwrap();
            assert_eq!(state.objects[&id].x, 30.0);
        }

        coord.remove_object(&id).await;
        assert!(recorded.lock().unwrap().objects.is_empty());
    }

    #[tokio::test]
    async fn test_import_export_reprojects() {
        let (mut source, _) = coordinator("alice");
        source.start_drawing(1.0, 1.0, 4.0, "#00f").await;
        source.continue_drawing(2.0, 2.0).await;
        source.end_drawing().await;
        source.add_text(5.0, 5.0, "note", 12.0, "#000").await;
        let snapshot = source.export_canvas_state();

        let (mut target, recorded) = coordinator("bob");
        target.initialize().await.unwrap();
        target.import_canvas_state(&snapshot).await.unwrap();

        let state = recorded.lock().unwrap();
        assert_eq!(state.segments.len(), 2);
        assert_eq!(state.objects.len(), 1);
        assert_eq!(target.store().operation_count(), 2);
    }

    #[tokio::test]
    async fn test_import_garbage_is_error() {
        let (mut coord, _) = coordinator("bob");
        let err = coord.import_canvas_state("%%% not a snapshot").await.unwrap_err();
        assert!(matches!(err, CollabError::Deserialization(_)));
        assert_eq!(coord.store().operation_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let (mut coord, recorded) = coordinator("alice");
        coord.initialize().await.unwrap();
        coord.disconnect().await;
        coord.disconnect().await;
        assert_eq!(recorded.lock().unwrap().releases, 1);
        assert!(!coord.is_ready());
    }

    #[tokio::test]
    async fn test_chat_reaches_application() {
        let (mut coord, _) = coordinator("bob");
        let mut events = coord.take_events().unwrap();
        coord.handle_envelope(UserId::from("alice"), Envelope::chat(UserId::from("alice"), "hi"));
        assert_eq!(
            events.try_recv().unwrap(),
            CollabEvent::Chat { from: UserId::from("alice"), text: "hi".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_changed_after_quiet_period() {
        let (mut coord, _) = coordinator("alice");
        let mut events = coord.take_events().unwrap();

        coord.start_drawing(0.0, 0.0, 3.0, "#000").await;
        coord.end_drawing().await;
        assert!(events.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(2_001)).await;
        while coord.content_changed.is_pending() {
            coord.step().await;
        }
        assert_eq!(events.try_recv().unwrap(), CollabEvent::ContentChanged);
    }
}
