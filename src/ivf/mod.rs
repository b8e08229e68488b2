//! Inverted-file (IVF) approximate nearest neighbor index.
//!
//! Vectors are partitioned into `nlist` clusters by k-means. A search ranks
//! the centroids against the query, probes the `nprobe` nearest clusters,
//! and scores every vector in them exhaustively. Until the first build,
//! vectors sit in a pending pool that is searched exhaustively.

pub mod candidate_queue;
pub mod kmeans;

pub use kmeans::{KMeansParams, KMeansResult};

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::distance::{squared_euclidean, Metric};
use crate::error::{Result, RetrievalError};
use crate::flat_index::FlatIndex;
use crate::index::{Index, ScoredId};
use crate::persistence::serialization::{IndexSnapshot, SerializedList};
use crate::vector::{Vector, VectorId};

use candidate_queue::{Candidate, TopK};

/// Fraction of clusters probed when the caller does not choose `nprobe`.
pub const DEFAULT_NPROBE_FRACTION: f32 = 0.6;

/// Lists smaller than this are scored on the calling thread.
const PARALLEL_PROBE_THRESHOLD: usize = 4096;

/// One cluster: its centroid and the vectors assigned to it.
#[derive(Debug, Clone, Default)]
struct InvertedList {
    ids: Vec<VectorId>,
    vectors: Vec<Vector>,
}

impl InvertedList {
    fn push(&mut self, id: VectorId, vector: Vector) {
        self.ids.push(id);
        self.vectors.push(vector);
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Summary of a completed `build_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildStats {
    pub nlist: usize,
    pub iterations: usize,
    pub cluster_sizes: Vec<usize>,
}

/// The ANN index engine owned by one collection.
#[derive(Debug, Clone)]
pub struct IvfIndex {
    dimension: usize,
    metric: Metric,
    centroids: Vec<Vec<f32>>,
    lists: Vec<InvertedList>,
    pending: FlatIndex,
    tombstones: HashSet<VectorId>,
    next_id: VectorId,
}

impl IvfIndex {
    /// Create an empty, unbuilt index.
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            centroids: Vec::new(),
            lists: Vec::new(),
            pending: FlatIndex::new(metric),
            tombstones: HashSet::new(),
            next_id: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Whether centroids have been trained.
    pub fn is_built(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// Number of clusters, zero before the first build.
    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    /// The id the next insert will receive.
    pub fn next_id(&self) -> VectorId {
        self.next_id
    }

    /// Vectors waiting in the unindexed pool.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        self.lists.iter().map(InvertedList::len).collect()
    }

    /// Vectors that are held and not tombstoned.
    pub fn live_len(&self) -> usize {
        self.len() - self.tombstones.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.pending.get_vector(id).is_some() || self.lists.iter().any(|l| l.ids.contains(&id))
    }

    pub fn is_tombstoned(&self, id: VectorId) -> bool {
        self.tombstones.contains(&id)
    }

    /// Every id held by the index, ascending.
    pub fn ids(&self) -> Vec<VectorId> {
        let mut ids: Vec<VectorId> = self
            .lists
            .iter()
            .flat_map(|l| l.ids.iter().copied())
            .chain(self.pending.ids())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Held ids that searches can return, ascending.
    pub fn live_ids(&self) -> Vec<VectorId> {
        self.ids()
            .into_iter()
            .filter(|id| !self.tombstones.contains(id))
            .collect()
    }

    /// `nprobe` used when the caller passes none.
    pub fn default_nprobe(&self, fraction: f32) -> usize {
        let nlist = self.nlist();
        if nlist == 0 {
            return 0;
        }
        ((nlist as f32 * fraction).ceil() as usize).clamp(1, nlist)
    }

    /// Assign a fresh id and commit `vector` into the index.
    ///
    /// After a build the vector joins the list of its nearest centroid;
    /// before, it joins the pending pool. Old vectors are never moved.
    pub fn insert(&mut self, vector: Vector) -> Result<VectorId> {
        vector.check_dimension(self.dimension)?;
        let id = self.next_id;
        self.place(id, vector)?;
        self.next_id += 1;
        Ok(id)
    }

    /// Re-insert a vector under a previously assigned id (log replay).
    pub fn restore(&mut self, id: VectorId, vector: Vector) -> Result<()> {
        vector.check_dimension(self.dimension)?;
        if id < self.next_id {
            return Err(RetrievalError::invalid_parameter(format!(
                "vector id {id} is below the next free id {}",
                self.next_id
            )));
        }
        self.place(id, vector)?;
        self.next_id = id + 1;
        Ok(())
    }

    fn place(&mut self, id: VectorId, vector: Vector) -> Result<()> {
        if self.is_built() {
            let cluster = kmeans::nearest_centroid(vector.as_slice(), &self.centroids);
            self.lists[cluster].push(id, vector);
            Ok(())
        } else {
            self.pending.add(id, vector)
        }
    }

    /// Exclude `id` from all future searches. Returns false if it was
    /// already tombstoned or is not held.
    pub fn tombstone(&mut self, id: VectorId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.tombstones.insert(id)
    }

    /// Train `nlist` centroids over every held vector and rebuild the lists.
    ///
    /// Pending vectors are folded in, so the pool is empty afterwards.
    pub fn build_index(
        &mut self,
        nlist: usize,
        params: &KMeansParams,
        cancel: Option<&AtomicBool>,
    ) -> Result<BuildStats> {
        let mut entries: Vec<(VectorId, Vector)> = self
            .lists
            .iter()
            .flat_map(|l| l.ids.iter().copied().zip(l.vectors.iter().cloned()))
            .chain(self.pending.iter().map(|(&id, v)| (id, v.clone())))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);

        let slices: Vec<&[f32]> = entries.iter().map(|(_, v)| v.as_slice()).collect();
        let result = kmeans::kmeans(&slices, nlist, params, cancel)?;

        let mut lists = vec![InvertedList::default(); nlist];
        for ((id, vector), &cluster) in entries.into_iter().zip(&result.assignments) {
            lists[cluster].push(id, vector);
        }

        self.centroids = result.centroids;
        self.lists = lists;
        self.pending = FlatIndex::new(self.metric);

        let stats = BuildStats {
            nlist,
            iterations: result.iterations,
            cluster_sizes: self.cluster_sizes(),
        };
        info!(
            nlist,
            iterations = stats.iterations,
            vectors = self.len(),
            "built IVF index"
        );
        Ok(stats)
    }

    /// Approximate top-K search probing the `nprobe` nearest clusters.
    ///
    /// Falls back to exhaustive search of the pending pool when no index
    /// has been built. Tombstoned ids are never returned.
    pub fn search(&self, query: &Vector, top_k: usize, nprobe: usize) -> Result<Vec<ScoredId>> {
        query.check_dimension(self.dimension)?;
        if top_k == 0 {
            return Err(RetrievalError::invalid_parameter("top_k must be at least 1"));
        }
        if !self.is_built() {
            return self.pending.search_excluding(query, top_k, &self.tombstones);
        }
        if nprobe == 0 || nprobe > self.nlist() {
            return Err(RetrievalError::invalid_parameter(format!(
                "nprobe must be between 1 and nlist ({}), got {nprobe}",
                self.nlist()
            )));
        }

        let probed = self.probe_order(query, nprobe);
        let candidates: usize = probed.iter().map(|&c| self.lists[c].len()).sum();
        debug!(nprobe, candidates, "probing clusters");

        let top = if candidates >= PARALLEL_PROBE_THRESHOLD {
            probed
                .par_iter()
                .map(|&c| self.score_list(c, query, top_k))
                .reduce(
                    || TopK::new(top_k),
                    |mut a, b| {
                        a.extend(b);
                        a
                    },
                )
        } else {
            let mut top = TopK::new(top_k);
            for &c in &probed {
                top.extend(self.score_list(c, query, top_k));
            }
            top
        };

        Ok(top
            .into_sorted_vec()
            .into_iter()
            .map(|c| ScoredId {
                id: c.id,
                score: self.metric.rank_key(c.key),
            })
            .collect())
    }

    /// Cluster indices ordered by centroid distance to `query`, first `nprobe`.
    fn probe_order(&self, query: &Vector, nprobe: usize) -> Vec<usize> {
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, squared_euclidean(query.as_slice(), c)))
            .collect();
        order.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        order.into_iter().take(nprobe).map(|(i, _)| i).collect()
    }

    fn score_list(&self, cluster: usize, query: &Vector, top_k: usize) -> TopK {
        let list = &self.lists[cluster];
        let mut top = TopK::new(top_k);
        for (&id, vector) in list.ids.iter().zip(&list.vectors) {
            if self.tombstones.contains(&id) {
                continue;
            }
            let score = self.metric.score(query.as_slice(), vector.as_slice());
            top.push(Candidate::new(id, self.metric.rank_key(score)));
        }
        top
    }

    /// Capture the full index state for persistence.
    pub fn to_snapshot(&self) -> IndexSnapshot {
        let mut tombstones: Vec<VectorId> = self.tombstones.iter().copied().collect();
        tombstones.sort_unstable();
        IndexSnapshot {
            dimension: self.dimension,
            metric: self.metric,
            next_id: self.next_id,
            centroids: self.centroids.clone(),
            lists: self
                .lists
                .iter()
                .map(|l| SerializedList {
                    ids: l.ids.clone(),
                    data: l.vectors.iter().map(|v| v.as_slice().to_vec()).collect(),
                })
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|(&id, v)| (id, v.as_slice().to_vec()))
                .collect(),
            tombstones,
        }
    }

    /// Rebuild an index from a snapshot.
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Result<Self> {
        if snapshot.centroids.len() != snapshot.lists.len() {
            return Err(RetrievalError::Serialization(format!(
                "snapshot has {} centroids but {} lists",
                snapshot.centroids.len(),
                snapshot.lists.len()
            )));
        }
        let mut index = IvfIndex::new(snapshot.dimension, snapshot.metric);
        index.centroids = snapshot.centroids;
        for list in snapshot.lists {
            if list.ids.len() != list.data.len() {
                return Err(RetrievalError::Serialization(
                    "inverted list ids and vectors differ in length".to_string(),
                ));
            }
            let mut restored = InvertedList::default();
            for (id, data) in list.ids.into_iter().zip(list.data) {
                let vector = Vector::new(data);
                vector.check_dimension(index.dimension)?;
                restored.push(id, vector);
            }
            index.lists.push(restored);
        }
        for (id, data) in snapshot.pending {
            index.pending.add(id, Vector::new(data))?;
        }
        index.tombstones = snapshot.tombstones.into_iter().collect();
        index.next_id = snapshot.next_id;
        Ok(index)
    }
}

impl Index for IvfIndex {
    fn add(&mut self, id: VectorId, vector: Vector) -> Result<()> {
        self.restore(id, vector)
    }

    fn search(&self, query: &Vector, k: usize) -> Result<Vec<ScoredId>> {
        let nprobe = self.default_nprobe(DEFAULT_NPROBE_FRACTION);
        IvfIndex::search(self, query, k, nprobe)
    }

    fn get_vector(&self, id: VectorId) -> Option<&Vector> {
        self.pending.get_vector(id).or_else(|| {
            self.lists.iter().find_map(|l| {
                l.ids
                    .iter()
                    .position(|&x| x == id)
                    .map(|pos| &l.vectors[pos])
            })
        })
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn len(&self) -> usize {
        self.pending.len() + self.lists.iter().map(InvertedList::len).sum::<usize>()
    }
}
