//! Search metrics and score ordering

use serde::{Deserialize, Serialize};

/// Metric a collection scores vectors with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Inner product; higher scores are better.
    #[serde(rename = "ip")]
    InnerProduct,
    /// Euclidean (L2) distance; lower scores are better.
    #[serde(rename = "l2")]
    L2,
}

impl Metric {
    /// Raw score between two equal-length slices under this metric.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::InnerProduct => dot_product(a, b),
            Metric::L2 => euclidean_distance(a, b),
        }
    }

    /// Map a score onto a key where smaller is always better.
    pub fn rank_key(&self, score: f32) -> f32 {
        match self {
            Metric::InnerProduct => -score,
            Metric::L2 => score,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::InnerProduct => write!(f, "ip"),
            Metric::L2 => write!(f, "l2"),
        }
    }
}

/// Compute Euclidean (L2) distance between two slices
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    squared_euclidean(a, b).sqrt()
}

/// Squared Euclidean distance, used where only the ordering matters.
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Compute dot product of two slices
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
