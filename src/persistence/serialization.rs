//! Serialization utilities: bincode for index state, JSON for manifests and config.

use crate::collection::CollectionSchema;
use crate::distance::Metric;
use crate::error::{Result, RetrievalError};
use crate::vector::VectorId;
use serde::{Deserialize, Serialize};

/// One inverted list: ids and their vectors, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedList {
    pub ids: Vec<VectorId>,
    pub data: Vec<Vec<f32>>,
}

/// Serializable representation of an IVF index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub dimension: usize,
    pub metric: Metric,
    pub next_id: VectorId,
    pub centroids: Vec<Vec<f32>>,
    pub lists: Vec<SerializedList>,
    pub pending: Vec<(VectorId, Vec<f32>)>,
    pub tombstones: Vec<VectorId>,
}

/// Serializable representation of a whole collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub name: String,
    pub schema: CollectionSchema,
    pub index: IndexSnapshot,
}

/// Encode data to bincode bytes.
pub fn to_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| RetrievalError::Serialization(e.to_string()))
}

/// Decode data from bincode bytes.
pub fn from_bincode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| RetrievalError::Serialization(e.to_string()))
}

/// Encode data to pretty JSON bytes.
pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| RetrievalError::Serialization(e.to_string()))
}

/// Decode data from JSON bytes.
pub fn from_json<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| RetrievalError::Serialization(e.to_string()))
}
