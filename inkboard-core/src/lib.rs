//! Inkboard core: the shared drawing model and its replicated store.
//!
//! Everything a room agrees on lives in a [`SharedDocumentStore`]: the
//! append-only drawing log, the canvas objects, the background image and
//! the brush defaults. Local writes apply immediately and return a delta;
//! remote deltas merge in any order and converge.

pub mod error;
pub mod model;
pub mod store;

pub use error::StoreError;
pub use model::{
    now_millis, BackgroundState, BackgroundTransform, BrushDefaults, CanvasObject,
    DrawingOperation, ObjectId, ObjectKind, ObjectTransform, ObjectUpdate, OperationId,
    OperationKind, OperationSequence, ShapeTool, Size, UserId,
};
pub use store::{Delta, SharedDocumentStore, StoreChanges};
