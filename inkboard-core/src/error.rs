use thiserror::Error;

use crate::model::ObjectId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to decode replica state: {0}")]
    Deserialization(String),
    #[error("Failed to encode replica state: {0}")]
    Serialization(String),
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),
}
