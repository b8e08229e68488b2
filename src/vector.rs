//! Vector type and identifiers

use crate::error::{Result, RetrievalError};
use serde::{Deserialize, Serialize};

/// Identifier assigned by an index at insertion time.
///
/// Unique within a collection, monotonically increasing, never reused.
pub type VectorId = u64;

/// A fixed-dimension embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    /// Create a new vector from a Vec<f32>
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Get the dimension of the vector
    pub fn dimension(&self) -> usize {
        self.data.len()
    }

    /// Get the underlying data as a slice
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Fail with `DimensionMismatch` unless the vector has `expected` components.
    pub fn check_dimension(&self, expected: usize) -> Result<()> {
        if self.dimension() != expected {
            return Err(RetrievalError::DimensionMismatch {
                expected,
                actual: self.dimension(),
            });
        }
        Ok(())
    }

    /// Sum of absolute values.
    pub fn l1_norm(&self) -> f32 {
        self.data.iter().map(|x| x.abs()).sum()
    }

    /// Euclidean length.
    pub fn l2_norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Vector::new(data)
    }
}
