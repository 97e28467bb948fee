//! Ephemeral presence: cursors, selections and drawing/typing flags.
//!
//! ## Lifecycle of a remote user
//!
//! ```text
//! absent ──first update──► present/active ──30s idle──► stale
//!    ▲                          ▲   │                     │
//!    │                          └───┘ refresh             │
//!    └──────── leave / 5min idle (Left event) ◄───────────┘
//! ```
//!
//! Stale users are hidden from [`AwarenessChannel::active_users`] but kept
//! until evicted. Nothing here is persisted; losing it loses no data.
//!
//! Local updates are throttled per kind (cursor, selection, drawing,
//! typing): the first change in a window goes out immediately, later ones
//! are folded into one trailing update returned by
//! [`AwarenessChannel::flush_pending`].

use std::collections::HashMap;
use std::time::Duration;

use inkboard_core::{ObjectId, UserId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::protocol::{decode_payload, encode_payload, ProtocolError};

pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(100);
pub const DEFAULT_STALE_AFTER_MS: u64 = 30_000;
pub const DEFAULT_EVICT_AFTER_MS: u64 = 5 * 60_000;

/// Fixed cursor palette; users map onto it by hash.
pub const USER_PALETTE: [&str; 10] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4",
    "#42d4f4", "#f032e6", "#9a6324", "#800000", "#469990",
];

/// Deterministic colour for a user. Same id, same colour, on every client.
pub fn user_color(user_id: &UserId) -> &'static str {
    // FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.as_str().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    USER_PALETTE[hash as usize % USER_PALETTE.len()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    pub color: String,
}

impl UserInfo {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        let color = user_color(&id).to_string();
        Self {
            id,
            name: name.into(),
            color,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Presence of one user as last seen.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessState {
    pub user: UserInfo,
    pub cursor: Option<CursorPosition>,
    pub selection: Vec<ObjectId>,
    pub is_drawing: bool,
    pub is_typing: bool,
    /// Local wall-clock millis of the last refresh
    pub last_seen: u64,
}

impl AwarenessState {
    fn new(user: UserInfo, now_ms: u64) -> Self {
        Self {
            user,
            cursor: None,
            selection: Vec::new(),
            is_drawing: false,
            is_typing: false,
            last_seen: now_ms,
        }
    }

    fn apply(&mut self, update: &AwarenessUpdate) {
        if let Some(user) = &update.user {
            self.user = user.clone();
        }
        if let Some(cursor) = update.cursor {
            self.cursor = cursor;
        }
        if let Some(selection) = &update.selection {
            self.selection = selection.clone();
        }
        if let Some(drawing) = update.is_drawing {
            self.is_drawing = drawing;
        }
        if let Some(typing) = update.is_typing {
            self.is_typing = typing;
        }
    }
}

/// Partial presence update. `None` leaves a field unchanged;
/// `cursor: Some(None)` hides the cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub user: Option<UserInfo>,
    pub cursor: Option<Option<CursorPosition>>,
    pub selection: Option<Vec<ObjectId>>,
    pub is_drawing: Option<bool>,
    pub is_typing: Option<bool>,
}

/// Presence frames exchanged over the relay and the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Update {
        user_id: UserId,
        update: AwarenessUpdate,
    },
    /// Clean disconnect
    Leave { user_id: UserId },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            AwarenessMessage::Update { user_id, .. } => user_id,
            AwarenessMessage::Leave { user_id } => user_id,
        }
    }
}

/// Transitions caused by remote presence traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessEvent {
    Joined(UserId),
    Updated(UserId),
    /// `is_drawing` went from true to false
    DrawingStopped(UserId),
    Left(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Cursor = 0,
    Selection = 1,
    Drawing = 2,
    Typing = 3,
}

const KINDS: [Kind; 4] = [Kind::Cursor, Kind::Selection, Kind::Drawing, Kind::Typing];

pub struct AwarenessChannel {
    local: AwarenessState,
    peers: HashMap<UserId, AwarenessState>,
    throttle: Duration,
    stale_after_ms: u64,
    evict_after_ms: u64,
    last_sent: [Option<Instant>; 4],
    dirty: [bool; 4],
}

impl AwarenessChannel {
    pub fn new(local_user: UserInfo) -> Self {
        Self {
            local: AwarenessState::new(local_user, 0),
            peers: HashMap::new(),
            throttle: DEFAULT_THROTTLE,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            evict_after_ms: DEFAULT_EVICT_AFTER_MS,
            last_sent: [None; 4],
            dirty: [false; 4],
        }
    }

    pub fn with_timings(
        local_user: UserInfo,
        throttle: Duration,
        stale_after_ms: u64,
        evict_after_ms: u64,
    ) -> Self {
        Self {
            throttle,
            stale_after_ms,
            evict_after_ms,
            ..Self::new(local_user)
        }
    }

    pub fn local_user(&self) -> &UserInfo {
        &self.local.user
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    // ── Local user ──────────────────────────────────────────────

    pub fn update_current_user_cursor(
        &mut self,
        cursor: Option<CursorPosition>,
        now: Instant,
    ) -> Option<AwarenessMessage> {
        self.local.cursor = cursor;
        self.throttled(Kind::Cursor, now)
    }

    pub fn update_current_user_selection(
        &mut self,
        selection: Vec<ObjectId>,
        now: Instant,
    ) -> Option<AwarenessMessage> {
        self.local.selection = selection;
        self.throttled(Kind::Selection, now)
    }

    pub fn update_current_user_drawing(
        &mut self,
        is_drawing: bool,
        now: Instant,
    ) -> Option<AwarenessMessage> {
        self.local.is_drawing = is_drawing;
        self.throttled(Kind::Drawing, now)
    }

    pub fn update_current_user_typing(
        &mut self,
        is_typing: bool,
        now: Instant,
    ) -> Option<AwarenessMessage> {
        self.local.is_typing = is_typing;
        self.throttled(Kind::Typing, now)
    }

    /// Trailing update for every kind whose throttle window has elapsed.
    pub fn flush_pending(&mut self, now: Instant) -> Option<AwarenessMessage> {
        let mut due = Vec::new();
        for kind in KINDS {
            let slot = kind as usize;
            if !self.dirty[slot] {
                continue;
            }
            let ready = self.last_sent[slot]
                .map_or(true, |last| now.duration_since(last) >= self.throttle);
            if ready {
                self.dirty[slot] = false;
                self.last_sent[slot] = Some(now);
                due.push(kind);
            }
        }
        if due.is_empty() {
            None
        } else {
            Some(self.local_message(&due))
        }
    }

    /// When the next trailing update becomes due, if any is pending.
    pub fn next_flush_deadline(&self) -> Option<Instant> {
        KINDS
            .iter()
            .filter(|kind| self.dirty[**kind as usize])
            .filter_map(|kind| self.last_sent[*kind as usize].map(|last| last + self.throttle))
            .min()
    }

    /// Full local state, for announcing ourselves to new peers.
    pub fn full_state_message(&self) -> AwarenessMessage {
        self.local_message(&KINDS)
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            user_id: self.local.user.id.clone(),
        }
    }

    fn throttled(&mut self, kind: Kind, now: Instant) -> Option<AwarenessMessage> {
        let slot = kind as usize;
        match self.last_sent[slot] {
            Some(last) if now.duration_since(last) < self.throttle => {
                self.dirty[slot] = true;
                None
            }
            _ => {
                self.last_sent[slot] = Some(now);
                self.dirty[slot] = false;
                Some(self.local_message(&[kind]))
            }
        }
    }

    fn local_message(&self, kinds: &[Kind]) -> AwarenessMessage {
        let mut update = AwarenessUpdate {
            user: Some(self.local.user.clone()),
            ..Default::default()
        };
        for kind in kinds {
            match kind {
                Kind::Cursor => update.cursor = Some(self.local.cursor),
                Kind::Selection => update.selection = Some(self.local.selection.clone()),
                Kind::Drawing => update.is_drawing = Some(self.local.is_drawing),
                Kind::Typing => update.is_typing = Some(self.local.is_typing),
            }
        }
        AwarenessMessage::Update {
            user_id: self.local.user.id.clone(),
            update,
        }
    }

    // ── Remote users ────────────────────────────────────────────

    pub fn handle_message(&mut self, message: &AwarenessMessage, now_ms: u64) -> Vec<AwarenessEvent> {
        match message {
            AwarenessMessage::Update { user_id, update } => {
                self.update_user_awareness(user_id, update, now_ms)
            }
            AwarenessMessage::Leave { user_id } => self.remove_user(user_id).into_iter().collect(),
        }
    }

    /// Upsert a remote user's presence, creating it on first sight.
    pub fn update_user_awareness(
        &mut self,
        user_id: &UserId,
        update: &AwarenessUpdate,
        now_ms: u64,
    ) -> Vec<AwarenessEvent> {
        if *user_id == self.local.user.id {
            return Vec::new();
        }

        let mut events = Vec::new();
        let state = self.peers.entry(user_id.clone()).or_insert_with(|| {
            events.push(AwarenessEvent::Joined(user_id.clone()));
            AwarenessState::new(UserInfo::new(user_id.clone(), user_id.as_str()), now_ms)
        });

        let was_drawing = state.is_drawing;
        state.apply(update);
        state.last_seen = now_ms;

        if events.is_empty() {
            events.push(AwarenessEvent::Updated(user_id.clone()));
        }
        if was_drawing && !state.is_drawing {
            events.push(AwarenessEvent::DrawingStopped(user_id.clone()));
        }
        events
    }

    pub fn remove_user(&mut self, user_id: &UserId) -> Option<AwarenessEvent> {
        self.peers
            .remove(user_id)
            .map(|_| AwarenessEvent::Left(user_id.clone()))
    }

    pub fn user(&self, user_id: &UserId) -> Option<&AwarenessState> {
        self.peers.get(user_id)
    }

    pub fn user_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote users refreshed within the stale window.
    pub fn active_users(&self, now_ms: u64) -> Vec<&AwarenessState> {
        let mut active: Vec<_> = self
            .peers
            .values()
            .filter(|state| now_ms.saturating_sub(state.last_seen) <= self.stale_after_ms)
            .collect();
        active.sort_by(|a, b| a.user.id.cmp(&b.user.id));
        active
    }

    /// Evict users idle past the eviction window, one `Left` each.
    pub fn cleanup_inactive_users(&mut self, now_ms: u64) -> Vec<AwarenessEvent> {
        let evict_after = self.evict_after_ms;
        let mut expired: Vec<UserId> = self
            .peers
            .iter()
            .filter(|(_, state)| now_ms.saturating_sub(state.last_seen) > evict_after)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|id| {
                log::debug!("Evicting idle user {id}");
                self.remove_user(&id)
            })
            .collect()
    }
}
