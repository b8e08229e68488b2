//! Lloyd's k-means with k-means++ seeding, used to train IVF centroids.
//!
//! Clustering always uses squared Euclidean distance, the same measure the
//! coarse quantizer assigns and probes lists with, whatever the collection
//! metric.
//!
//! Runs are deterministic for a fixed seed. The assignment step runs on rayon.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::distance::squared_euclidean;
use crate::error::{Result, RetrievalError};

const EPSILON: f32 = 1e-12;

/// Parameters controlling a clustering run.
#[derive(Debug, Clone)]
pub struct KMeansParams {
    /// Upper bound on Lloyd iterations.
    pub max_iterations: usize,
    /// Stop once mean centroid movement drops below this.
    pub tolerance: f32,
    /// Seed for k-means++ initialization. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-4,
            seed: Some(42),
        }
    }
}

/// Output of a clustering run.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    pub centroids: Vec<Vec<f32>>,
    /// Centroid index for each input vector.
    pub assignments: Vec<usize>,
    pub iterations: usize,
}

/// Cluster `vectors` into `k` groups.
///
/// `cancel` is polled between iterations; setting it aborts the run with
/// `Cancelled`.
pub fn kmeans(
    vectors: &[&[f32]],
    k: usize,
    params: &KMeansParams,
    cancel: Option<&AtomicBool>,
) -> Result<KMeansResult> {
    if k == 0 {
        return Err(RetrievalError::invalid_parameter("nlist must be at least 1"));
    }
    if k > vectors.len() {
        return Err(RetrievalError::InsufficientData {
            requested: k,
            available: vectors.len(),
        });
    }
    let dimension = vectors[0].len();
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(RetrievalError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }

    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut centroids = init_plus_plus(vectors, k, &mut rng);
    let mut assignments = assign_all(vectors, &centroids);
    let mut iterations = 0;

    while iterations < params.max_iterations {
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(RetrievalError::Cancelled { iterations });
        }
        iterations += 1;

        let updated = update_centroids(vectors, &assignments, &centroids);
        let movement = mean_movement(&centroids, &updated);
        centroids = updated;

        let reassigned = assign_all(vectors, &centroids);
        let stable = reassigned == assignments;
        assignments = reassigned;

        if stable || movement < params.tolerance {
            break;
        }
    }

    debug!(k, iterations, n = vectors.len(), "k-means finished");

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

/// Index of the centroid nearest to `vector`; ties go to the lower index.
pub fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let dist = squared_euclidean(vector, centroid);
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best
}

fn assign_all(vectors: &[&[f32]], centroids: &[Vec<f32>]) -> Vec<usize> {
    vectors
        .par_iter()
        .map(|v| nearest_centroid(v, centroids))
        .collect()
}

/// k-means++: each next centroid is drawn with probability proportional
/// to its squared distance from the nearest centroid chosen so far.
fn init_plus_plus(vectors: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let mut chosen = Vec::with_capacity(k);
    let mut used = vec![false; n];

    let first = rng.gen_range(0..n);
    chosen.push(vectors[first].to_vec());
    used[first] = true;

    let mut min_dist: Vec<f32> = vectors
        .iter()
        .map(|v| squared_euclidean(v, &chosen[0]))
        .collect();

    while chosen.len() < k {
        let total: f32 = min_dist.iter().sum();
        let next = if total > EPSILON {
            let target = rng.gen::<f32>() * total;
            let mut cumulative = 0.0;
            let mut pick = None;
            for (i, &d) in min_dist.iter().enumerate() {
                cumulative += d;
                if d > 0.0 && cumulative >= target {
                    pick = Some(i);
                    break;
                }
            }
            // Rounding can leave the target just past the last weight.
            pick.or_else(|| min_dist.iter().rposition(|&d| d > 0.0))
        } else {
            None
        };
        // Every remaining point coincides with a centroid: take the next unused one.
        let next = next
            .or_else(|| used.iter().position(|u| !u))
            .unwrap_or(0);

        used[next] = true;
        chosen.push(vectors[next].to_vec());
        let centroid = &chosen[chosen.len() - 1];
        for (d, v) in min_dist.iter_mut().zip(vectors.iter()) {
            *d = d.min(squared_euclidean(v, centroid));
        }
    }

    chosen
}

fn update_centroids(
    vectors: &[&[f32]],
    assignments: &[usize],
    previous: &[Vec<f32>],
) -> Vec<Vec<f32>> {
    let k = previous.len();
    let dimension = previous[0].len();
    let mut sums = vec![vec![0.0f32; dimension]; k];
    let mut counts = vec![0usize; k];

    for (vector, &cluster) in vectors.iter().zip(assignments) {
        for (acc, &x) in sums[cluster].iter_mut().zip(vector.iter()) {
            *acc += x;
        }
        counts[cluster] += 1;
    }

    let mut taken = vec![false; vectors.len()];
    for cluster in 0..k {
        if counts[cluster] > 0 {
            let size = counts[cluster] as f32;
            for x in sums[cluster].iter_mut() {
                *x /= size;
            }
        } else {
            // Empty cluster: reseed at the point farthest from its own centroid.
            let far = vectors
                .iter()
                .enumerate()
                .filter(|(i, _)| !taken[*i])
                .map(|(i, v)| (i, squared_euclidean(v, &previous[assignments[i]])))
                .fold(None, |best: Option<(usize, f32)>, (i, d)| match best {
                    Some((_, bd)) if bd >= d => best,
                    _ => Some((i, d)),
                });
            match far {
                Some((i, _)) => {
                    taken[i] = true;
                    sums[cluster] = vectors[i].to_vec();
                }
                None => sums[cluster] = previous[cluster].clone(),
            }
        }
    }
    sums
}

fn mean_movement(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new.iter())
        .map(|(a, b)| squared_euclidean(a, b).sqrt())
        .sum::<f32>()
        / old.len() as f32
}
