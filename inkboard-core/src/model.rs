//! Shared data model for the drawing surface.
//!
//! Field names serialize in camelCase so snapshots and mesh envelopes stay
//! readable by non-Rust peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Smallest background scale accepted by any write path.
pub const MIN_BACKGROUND_SCALE: f64 = 0.1;
/// Largest background scale accepted by any write path.
pub const MAX_BACKGROUND_SCALE: f64 = 5.0;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Identity of a collaborating user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Client-generated, room-unique canvas object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Fresh random id. Collision-free across clients without coordination.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Canonical identity of one drawing operation.
///
/// `seq` is a per-client counter, so two operations from the same user in
/// the same millisecond still get distinct ids. The same operation arriving
/// over the relay and over the mesh carries the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationId {
    pub user_id: UserId,
    pub timestamp: u64,
    pub seq: u64,
}

impl OperationId {
    pub fn new(user_id: UserId, timestamp: u64, seq: u64) -> Self {
        Self { user_id, timestamp, seq }
    }

    /// Flat string form used as the replica map key.
    pub fn to_key(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.timestamp, self.seq)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Hands out operation ids for the local user.
#[derive(Debug, Clone)]
pub struct OperationSequence {
    user_id: UserId,
    next_seq: u64,
}

impl OperationSequence {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id, next_seq: 0 }
    }

    /// Next id stamped with the current wall clock.
    pub fn next_id(&mut self) -> OperationId {
        self.next_id_at(now_millis())
    }

    pub fn next_id_at(&mut self, timestamp: u64) -> OperationId {
        let seq = self.next_seq;
        self.next_seq += 1;
        OperationId::new(self.user_id.clone(), timestamp, seq)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

// ───────────────────────────────────────────────────────────────────
// Drawing operations
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Draw,
    Erase,
    Clear,
}

/// One immutable point-paint (or clear) in the shared drawing log.
///
/// The id is flattened, so `userId`, `timestamp` and `seq` sit next to
/// the point fields on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingOperation {
    #[serde(flatten)]
    pub id: OperationId,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    pub color: String,
    pub brush_size: f64,
}

impl DrawingOperation {
    pub fn stroke(
        id: OperationId,
        kind: OperationKind,
        x: f64,
        y: f64,
        brush_size: f64,
        color: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            x,
            y,
            pressure: None,
            color: color.into(),
            brush_size,
        }
    }

    pub fn clear(id: OperationId) -> Self {
        Self {
            id,
            kind: OperationKind::Clear,
            x: 0.0,
            y: 0.0,
            pressure: None,
            color: String::new(),
            brush_size: 0.0,
        }
    }

    pub fn with_pressure(mut self, pressure: f64) -> Self {
        self.pressure = Some(pressure);
        self
    }

    pub fn user_id(&self) -> &UserId {
        &self.id.user_id
    }

    pub fn timestamp(&self) -> u64 {
        self.id.timestamp
    }

    /// JSON has no encoding for NaN or infinities.
    pub fn is_finite(&self) -> bool {
        all_finite([self.x, self.y, self.brush_size]) && self.pressure.map_or(true, f64::is_finite)
    }
}

// ───────────────────────────────────────────────────────────────────
// Canvas objects
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeTool {
    Line,
    Arrow,
    Rectangle,
    Circle,
}

/// Type-specific fields of a canvas object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObjectKind {
    #[serde(rename_all = "camelCase")]
    Text {
        text: String,
        font_size: f64,
        color: String,
    },
    #[serde(rename_all = "camelCase")]
    Shape {
        tool: ShapeTool,
        x2: f64,
        y2: f64,
        brush_size: f64,
        color: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        data_url: String,
        width: f64,
        height: f64,
        scale: f64,
    },
}

impl ObjectKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Text { .. } => "text",
            ObjectKind::Shape { .. } => "shape",
            ObjectKind::Image { .. } => "image",
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            ObjectKind::Text { font_size, .. } => font_size.is_finite(),
            ObjectKind::Shape { x2, y2, brush_size, .. } => all_finite([*x2, *y2, *brush_size]),
            ObjectKind::Image { width, height, scale, .. } => all_finite([*width, *height, *scale]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: ObjectId,
    pub x: f64,
    pub y: f64,
    #[serde(flatten)]
    pub kind: ObjectKind,
}

impl CanvasObject {
    pub fn new(id: ObjectId, x: f64, y: f64, kind: ObjectKind) -> Self {
        Self { id, x, y, kind }
    }

    pub fn is_finite(&self) -> bool {
        all_finite([self.x, self.y]) && self.kind.is_finite()
    }

    /// Position and scale, the fields that change on drag/resize.
    pub fn transform(&self) -> ObjectTransform {
        let scale = match &self.kind {
            ObjectKind::Image { scale, .. } => Some(*scale),
            _ => None,
        };
        ObjectTransform { x: self.x, y: self.y, scale }
    }
}

/// Cheap-path update for an object already on the render target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectTransform {
    pub x: f64,
    pub y: f64,
    pub scale: Option<f64>,
}

/// Partial field set for `update_object`. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brush_size: Option<f64>,
}

impl ObjectUpdate {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn is_finite(&self) -> bool {
        [
            self.x,
            self.y,
            self.x2,
            self.y2,
            self.scale,
            self.width,
            self.height,
            self.font_size,
            self.brush_size,
        ]
        .into_iter()
        .flatten()
        .all(f64::is_finite)
    }
}

// ───────────────────────────────────────────────────────────────────
// Background
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// The single shared background image. Replaced as a whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundState {
    pub data_url: String,
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub original_size: Size,
}

impl BackgroundState {
    pub fn new(data_url: impl Into<String>, original_size: Size) -> Self {
        Self {
            data_url: data_url.into(),
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            original_size,
        }
    }

    pub fn clamp_scale(scale: f64) -> f64 {
        if scale.is_nan() {
            return 1.0;
        }
        scale.clamp(MIN_BACKGROUND_SCALE, MAX_BACKGROUND_SCALE)
    }

    pub fn clamped(mut self) -> Self {
        self.scale = Self::clamp_scale(self.scale);
        self
    }

    pub fn is_finite(&self) -> bool {
        all_finite([
            self.x,
            self.y,
            self.scale,
            self.original_size.width,
            self.original_size.height,
        ])
    }

    /// An empty data URL means "no background".
    pub fn has_image(&self) -> bool {
        !self.data_url.is_empty()
    }

    pub fn transform(&self) -> BackgroundTransform {
        BackgroundTransform {
            x: self.x,
            y: self.y,
            scale: self.scale,
        }
    }

    pub fn with_transform(mut self, transform: BackgroundTransform) -> Self {
        self.x = transform.x;
        self.y = transform.y;
        self.scale = Self::clamp_scale(transform.scale);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTransform {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
}

impl Default for BackgroundTransform {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, scale: 1.0 }
    }
}

/// Room-wide brush defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrushDefaults {
    pub size: f64,
    pub color: String,
}

impl Default for BrushDefaults {
    fn default() -> Self {
        Self {
            size: 5.0,
            color: "#000000".to_string(),
        }
    }
}

fn all_finite<const N: usize>(values: [f64; N]) -> bool {
    values.iter().all(|v| v.is_finite())
}
