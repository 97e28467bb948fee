//! Contract between the coordinator and whatever draws the canvas.
//!
//! The coordinator pushes remote state into a [`RenderTarget`]; the target
//! reports user input back as [`RenderEvent`]s on a channel handed out once
//! by [`RenderTarget::take_events`]. Everything on the target is a
//! projection of the shared store and can be rebuilt from it.

use inkboard_core::{
    BackgroundState, BackgroundTransform, CanvasObject, ObjectId, ObjectTransform, ObjectUpdate,
    ShapeTool, UserId,
};
use tokio::sync::mpsc;

use crate::error::RenderError;
use crate::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// One piece of a remote stroke. `from: None` paints a dot at `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct StrokeSegment {
    pub from: Option<Point>,
    pub to: Point,
    pub color: String,
    pub size: f64,
    pub erase: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeGeometry {
    pub tool: ShapeTool,
    pub x: f64,
    pub y: f64,
    pub x2: f64,
    pub y2: f64,
}

/// Natural size of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageInfo {
    pub width: f64,
    pub height: f64,
}

/// User input reported by the target.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    DrawStart { x: f64, y: f64 },
    DrawContinue { x: f64, y: f64 },
    DrawEnd,
    PointerMove { x: f64, y: f64 },
    TextInput { x: f64, y: f64, text: String },
    ShapeComplete(ShapeGeometry),
    ObjectMoved { id: ObjectId, x: f64, y: f64 },
    ObjectTransformed { id: ObjectId, update: ObjectUpdate },
    BackgroundScaleChange(f64),
    BackgroundTransformChange(BackgroundTransform),
}

pub trait RenderTarget: Send {
    fn is_ready(&self) -> bool;

    /// Resolves once the target can accept drawing calls.
    fn wait_for_initialization(&mut self) -> BoxFuture<'_, Result<(), RenderError>>;

    /// Input event channel. Yields `Some` once.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RenderEvent>>;

    // ── Drawing layer ───────────────────────────────────────────

    fn apply_remote_drawing(&mut self, user: &UserId, segment: &StrokeSegment) -> Result<(), RenderError>;
    fn clear_drawing(&mut self);

    // ── Remote cursors ──────────────────────────────────────────

    fn update_remote_cursor(&mut self, user: &UserId, x: f64, y: f64, color: &str);
    fn hide_remote_cursor(&mut self, user: &UserId);
    /// Forget the in-progress path for `user` so the next point starts fresh.
    fn reset_remote_path(&mut self, user: &UserId);

    // ── Objects ─────────────────────────────────────────────────

    fn object_ids(&self) -> Vec<ObjectId>;
    fn add_object(&mut self, object: &CanvasObject) -> Result<(), RenderError>;
    fn update_object(&mut self, id: &ObjectId, transform: ObjectTransform) -> Result<(), RenderError>;
    fn remove_object(&mut self, id: &ObjectId);

    // ── Background ──────────────────────────────────────────────

    fn background_state(&self) -> Option<BackgroundState>;
    /// Show `state` (or nothing). `notify` is false for remote updates,
    /// so the target must not report them back as input.
    fn set_background_transform(
        &mut self,
        state: Option<&BackgroundState>,
        notify: bool,
    ) -> Result<(), RenderError>;

    fn load_image_from_data_url(&mut self, data_url: &str) -> BoxFuture<'_, Result<ImageInfo, RenderError>>;

    /// Drop every resource. The target is unusable afterwards.
    fn release(&mut self);
}
