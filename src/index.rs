//! Index trait for pluggable search backends

use crate::distance::Metric;
use crate::error::Result;
use crate::vector::{Vector, VectorId};

/// One scored hit returned by an index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredId {
    pub id: VectorId,
    pub score: f32,
}

/// A search index over vectors keyed by `VectorId`.
///
/// Results are always ordered best-first under the index metric, with
/// ties broken by ascending `VectorId`.
pub trait Index {
    /// Add a vector under an id chosen by the caller.
    fn add(&mut self, id: VectorId, vector: Vector) -> Result<()>;

    /// Return up to `k` best hits for `query`.
    fn search(&self, query: &Vector, k: usize) -> Result<Vec<ScoredId>>;

    /// Retrieve a vector by id.
    fn get_vector(&self, id: VectorId) -> Option<&Vector>;

    /// The metric used by this index.
    fn metric(&self) -> Metric;

    /// The number of vectors in this index.
    fn len(&self) -> usize;

    /// Whether the index is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
