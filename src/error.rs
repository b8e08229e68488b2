//! Error types for the retrieval engine

use thiserror::Error;

use crate::vector::VectorId;

/// Result type alias for retrieval operations
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Error kinds that can occur while indexing, correlating, or searching.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Degenerate vector: cannot normalize a zero vector")]
    DegenerateVector,

    #[error("Insufficient data: {requested} clusters requested but only {available} vectors")]
    InsufficientData { requested: usize, available: usize },

    #[error("Duplicate vector id {id} in collection '{collection}'")]
    DuplicateVectorId { collection: String, id: VectorId },

    #[error("Dangling reference: vector id {id} has no record in collection '{collection}'")]
    DanglingReference { collection: String, id: VectorId },

    #[error("Collection not found: {name}")]
    CollectionNotFound { name: String },

    #[error("Invalid state: cannot {operation} collection '{collection}' while {state}")]
    InvalidState {
        collection: String,
        state: String,
        operation: &'static str,
    },

    #[error("Invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error("Index build cancelled after {iterations} iterations")]
    Cancelled { iterations: usize },

    #[error("Storage failure: {0}")]
    StorageFailure(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RetrievalError {
    pub(crate) fn invalid_parameter(reason: impl Into<String>) -> Self {
        RetrievalError::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// Whether this error comes from the persistence layer.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            RetrievalError::StorageFailure(_) | RetrievalError::Serialization(_)
        )
    }
}
