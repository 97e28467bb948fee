//! Turns remote point operations back into connected strokes.

use std::collections::HashMap;

use inkboard_core::{DrawingOperation, OperationKind, UserId};

use crate::render::{Point, StrokeSegment};

/// Minimum join distance, for thin brushes.
pub const MIN_CONNECT_DISTANCE: f64 = 10.0;

pub fn connect_threshold(brush_size: f64) -> f64 {
    MIN_CONNECT_DISTANCE.max(brush_size * 3.0)
}

/// Last rendered point per remote user.
#[derive(Debug, Default)]
pub struct StrokeTracker {
    last: HashMap<UserId, Point>,
}

impl StrokeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segment for `op`. Joins the user's previous point when it is close
    /// enough, otherwise starts a new dot.
    pub fn segment(&mut self, op: &DrawingOperation) -> StrokeSegment {
        let to = Point::new(op.x, op.y);
        let threshold = connect_threshold(op.brush_size);
        let from = self
            .last
            .insert(op.user_id().clone(), to)
            .filter(|prev| prev.distance(&to) <= threshold);

        StrokeSegment {
            from,
            to,
            color: op.color.clone(),
            size: op.brush_size,
            erase: op.kind == OperationKind::Erase,
        }
    }

    pub fn reset(&mut self, user: &UserId) {
        self.last.remove(user);
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}
