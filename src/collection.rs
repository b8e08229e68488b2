//! A named collection: schema, lifecycle state, and its IVF index.
//!
//! Every collection sits behind one reader/writer lock. Searches take the
//! read side and run in parallel; inserts, tombstones and index builds take
//! the write side, so a rebuild never races a cluster assignment.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::distance::Metric;
use crate::error::{Result, RetrievalError};
use crate::index::{Index, ScoredId};
use crate::ivf::{BuildStats, IvfIndex, KMeansParams};
use crate::normalize::Norm;
use crate::persistence::engine::StorageEngine;
use crate::persistence::serialization::CollectionSnapshot;
use crate::persistence::wal::IndexLogEntry;
use crate::vector::{Vector, VectorId};

/// Default number of clusters.
pub const DEFAULT_NLIST: usize = 500;

/// Static schema fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub dimension: usize,
    pub metric: Metric,
    pub norm: Norm,
    pub nlist: usize,
}

impl CollectionSchema {
    /// Schema with the legacy defaults: inner product over L1-normalized vectors.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: Metric::InnerProduct,
            norm: Norm::L1,
            nlist: DEFAULT_NLIST,
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_norm(mut self, norm: Norm) -> Self {
        self.norm = norm;
        self
    }

    pub fn with_nlist(mut self, nlist: usize) -> Self {
        self.nlist = nlist;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(RetrievalError::invalid_parameter("dimension must be at least 1"));
        }
        if self.nlist == 0 {
            return Err(RetrievalError::invalid_parameter("nlist must be at least 1"));
        }
        Ok(())
    }
}

/// Lifecycle state of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionState {
    Created,
    IndexBuilt,
    Loaded,
    Dropped,
}

impl std::fmt::Display for CollectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectionState::Created => "created",
            CollectionState::IndexBuilt => "index built",
            CollectionState::Loaded => "loaded",
            CollectionState::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

/// Point-in-time description of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub schema: CollectionSchema,
    pub state: CollectionState,
    pub vector_count: usize,
    pub live_count: usize,
    pub tombstoned: usize,
    pub pending: usize,
    pub cluster_sizes: Vec<usize>,
}

/// Runtime options a collection is opened with.
#[derive(Debug, Clone, Copy)]
pub struct CollectionOptions {
    pub nprobe_fraction: f32,
    pub checkpoint_interval: usize,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            nprobe_fraction: crate::ivf::DEFAULT_NPROBE_FRACTION,
            checkpoint_interval: 1000,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CollectionState,
    index: IvfIndex,
    storage: Option<StorageEngine>,
}

/// A named collection owning one IVF index.
#[derive(Debug)]
pub struct Collection {
    name: String,
    schema: CollectionSchema,
    options: CollectionOptions,
    inner: RwLock<Inner>,
}

impl Collection {
    /// A collection that lives only in memory.
    pub fn in_memory(name: &str, schema: CollectionSchema, options: CollectionOptions) -> Result<Self> {
        schema.validate()?;
        Ok(Self {
            name: name.to_string(),
            schema,
            options,
            inner: RwLock::new(Inner {
                state: CollectionState::Created,
                index: IvfIndex::new(schema.dimension, schema.metric),
                storage: None,
            }),
        })
    }

    /// Create a new persistent collection in `dir`.
    pub fn create(
        dir: &Path,
        name: &str,
        schema: CollectionSchema,
        options: CollectionOptions,
    ) -> Result<Self> {
        let collection = Self::in_memory(name, schema, options)?;
        let (mut storage, _) = StorageEngine::open(dir, options.checkpoint_interval)?;
        {
            let inner = collection.inner.read();
            storage.checkpoint(&collection.snapshot_of(&inner.index))?;
        }
        collection.inner.write().storage = Some(storage);
        Ok(collection)
    }

    /// Reopen a persistent collection: load its snapshot, then replay its WAL.
    pub fn open(dir: &Path, options: CollectionOptions) -> Result<Self> {
        let (storage, recovered) = StorageEngine::open(dir, options.checkpoint_interval)?;
        let snapshot = recovered.snapshot.ok_or_else(|| RetrievalError::CollectionNotFound {
            name: dir.display().to_string(),
        })?;

        let mut index = IvfIndex::from_snapshot(snapshot.index)?;
        let mut replayed = 0usize;
        for entry in recovered.entries {
            match entry {
                IndexLogEntry::Insert { id, data } => {
                    // Already captured by the snapshot if a checkpoint was interrupted.
                    if id < index.next_id() {
                        continue;
                    }
                    index.restore(id, Vector::new(data))?;
                }
                IndexLogEntry::Tombstone { id } => {
                    index.tombstone(id);
                }
            }
            replayed += 1;
        }

        let state = if index.is_built() {
            CollectionState::IndexBuilt
        } else {
            CollectionState::Created
        };
        info!(
            collection = %snapshot.name,
            vectors = index.len(),
            replayed,
            %state,
            "opened collection"
        );

        Ok(Self {
            name: snapshot.name,
            schema: snapshot.schema,
            options,
            inner: RwLock::new(Inner {
                state,
                index,
                storage: Some(storage),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> CollectionSchema {
        self.schema
    }

    pub fn state(&self) -> CollectionState {
        self.inner.read().state
    }

    fn invalid_state(&self, state: CollectionState, operation: &'static str) -> RetrievalError {
        RetrievalError::InvalidState {
            collection: self.name.clone(),
            state: state.to_string(),
            operation,
        }
    }

    fn snapshot_of(&self, index: &IvfIndex) -> CollectionSnapshot {
        CollectionSnapshot {
            name: self.name.clone(),
            schema: self.schema,
            index: index.to_snapshot(),
        }
    }

    /// Insert an already-normalized vector. Legal in every state but `Dropped`.
    ///
    /// The mutation is logged before it is applied, so a failed write leaves
    /// the collection unchanged.
    pub fn insert(&self, vector: Vector) -> Result<VectorId> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.state == CollectionState::Dropped {
            return Err(self.invalid_state(inner.state, "insert into"));
        }
        vector.check_dimension(self.schema.dimension)?;

        if let Some(storage) = inner.storage.as_mut() {
            storage.log(&IndexLogEntry::Insert {
                id: inner.index.next_id(),
                data: vector.as_slice().to_vec(),
            })?;
        }
        let id = inner.index.insert(vector)?;
        self.maybe_checkpoint(inner);
        Ok(id)
    }

    /// Exclude `id` from all future searches.
    ///
    /// The tombstone takes effect in memory even if logging it fails; the
    /// error is still returned so the caller can report it.
    pub fn tombstone(&self, id: VectorId) -> Result<bool> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.state == CollectionState::Dropped {
            return Err(self.invalid_state(inner.state, "tombstone in"));
        }
        if !inner.index.contains(id) || inner.index.is_tombstoned(id) {
            return Ok(false);
        }
        inner.index.tombstone(id);
        warn!(collection = %self.name, id, "tombstoned orphaned vector");
        if let Some(storage) = inner.storage.as_mut() {
            storage.log(&IndexLogEntry::Tombstone { id })?;
        }
        self.maybe_checkpoint(inner);
        Ok(true)
    }

    fn maybe_checkpoint(&self, inner: &mut Inner) {
        let Some(storage) = inner.storage.as_mut() else {
            return;
        };
        if !storage.should_checkpoint() {
            return;
        }
        let snapshot = CollectionSnapshot {
            name: self.name.clone(),
            schema: self.schema,
            index: inner.index.to_snapshot(),
        };
        // The WAL already holds every mutation, so a failed checkpoint loses nothing.
        if let Err(e) = storage.checkpoint(&snapshot) {
            warn!(collection = %self.name, error = %e, "checkpoint failed");
        }
    }

    /// Cluster every held vector into `schema.nlist` lists.
    ///
    /// `Created` moves to `IndexBuilt`; rebuilding a `Loaded` collection
    /// keeps it loaded.
    pub fn build_index(&self, params: &KMeansParams, cancel: Option<&AtomicBool>) -> Result<BuildStats> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.state == CollectionState::Dropped {
            return Err(self.invalid_state(inner.state, "build index for"));
        }

        let stats = inner.index.build_index(self.schema.nlist, params, cancel)?;
        if inner.state == CollectionState::Created {
            inner.state = CollectionState::IndexBuilt;
        }
        if let Some(storage) = inner.storage.as_mut() {
            let snapshot = CollectionSnapshot {
                name: self.name.clone(),
                schema: self.schema,
                index: inner.index.to_snapshot(),
            };
            storage.checkpoint(&snapshot)?;
        }
        info!(collection = %self.name, nlist = stats.nlist, "index built");
        Ok(stats)
    }

    /// Make the collection searchable.
    pub fn load(&self) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.state {
            CollectionState::Dropped => Err(self.invalid_state(inner.state, "load")),
            CollectionState::Loaded => Ok(()),
            CollectionState::Created | CollectionState::IndexBuilt => {
                if inner.state == CollectionState::Created {
                    debug!(collection = %self.name, "loading without an index; searches are exhaustive");
                }
                inner.state = CollectionState::Loaded;
                info!(collection = %self.name, "collection loaded");
                Ok(())
            }
        }
    }

    /// Release the searchable state.
    pub fn unload(&self) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.state {
            CollectionState::Loaded => {
                inner.state = if inner.index.is_built() {
                    CollectionState::IndexBuilt
                } else {
                    CollectionState::Created
                };
                info!(collection = %self.name, "collection unloaded");
                Ok(())
            }
            CollectionState::Dropped => Err(self.invalid_state(inner.state, "unload")),
            _ => Ok(()),
        }
    }

    /// Top-K search over a normalized query. Requires `Loaded`.
    ///
    /// `nprobe` defaults to the configured fraction of `nlist`.
    pub fn search(&self, query: &Vector, top_k: usize, nprobe: Option<usize>) -> Result<Vec<ScoredId>> {
        // Recursive: probing runs on rayon, whose workers may already hold a read guard.
        let inner = self.inner.read_recursive();
        if inner.state != CollectionState::Loaded {
            return Err(self.invalid_state(inner.state, "search"));
        }
        let nprobe = nprobe.unwrap_or_else(|| inner.index.default_nprobe(self.options.nprobe_fraction));
        inner.index.search(query, top_k, nprobe)
    }

    /// Ids that searches can return, ascending.
    pub fn live_ids(&self) -> Vec<VectorId> {
        self.inner.read().index.live_ids()
    }

    pub fn info(&self) -> CollectionInfo {
        let inner = self.inner.read();
        CollectionInfo {
            name: self.name.clone(),
            schema: self.schema,
            state: inner.state,
            vector_count: inner.index.len(),
            live_count: inner.index.live_len(),
            tombstoned: inner.index.tombstone_count(),
            pending: inner.index.pending_len(),
            cluster_sizes: inner.index.cluster_sizes(),
        }
    }

    /// Move to `Dropped`, releasing the index and deleting on-disk state.
    pub(crate) fn mark_dropped(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.state == CollectionState::Dropped {
            return Ok(());
        }
        inner.state = CollectionState::Dropped;
        inner.index = IvfIndex::new(self.schema.dimension, self.schema.metric);
        if let Some(storage) = inner.storage.take() {
            storage.destroy()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn schema() -> CollectionSchema {
        CollectionSchema::new(4).with_nlist(1)
    }

    fn params() -> KMeansParams {
        KMeansParams {
            seed: Some(3),
            ..KMeansParams::default()
        }
    }

    #[test]
    fn test_state_machine() {
        let c = Collection::in_memory("c", schema(), CollectionOptions::default()).unwrap();
        assert_eq!(c.state(), CollectionState::Created);

        c.insert(Vector::new(vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        c.build_index(&params(), None).unwrap();
        assert_eq!(c.state(), CollectionState::IndexBuilt);

        c.load().unwrap();
        assert_eq!(c.state(), CollectionState::Loaded);
        c.insert(Vector::new(vec![0.0, 1.0, 0.0, 0.0])).unwrap();

        c.build_index(&params(), None).unwrap();
        assert_eq!(c.state(), CollectionState::Loaded);

        c.unload().unwrap();
        assert_eq!(c.state(), CollectionState::IndexBuilt);

        c.mark_dropped().unwrap();
        assert_eq!(c.state(), CollectionState::Dropped);
        assert!(matches!(
            c.insert(Vector::new(vec![0.0; 4])),
            Err(RetrievalError::InvalidState { .. })
        ));
        assert!(matches!(c.load(), Err(RetrievalError::InvalidState { .. })));
    }

    #[test]
    fn test_search_requires_loaded() {
        let c = Collection::in_memory("c", schema(), CollectionOptions::default()).unwrap();
        c.insert(Vector::new(vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        let q = Vector::new(vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(
            c.search(&q, 1, None),
            Err(RetrievalError::InvalidState { .. })
        ));

        c.load().unwrap();
        assert_eq!(c.search(&q, 1, None).unwrap()[0].id, 0);
    }

    #[test]
    fn test_dimension_mismatch_leaves_state() {
        let c = Collection::in_memory("c", schema(), CollectionOptions::default()).unwrap();
        assert!(matches!(
            c.insert(Vector::new(vec![1.0, 2.0, 3.0])),
            Err(RetrievalError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
        let info = c.info();
        assert_eq!(info.vector_count, 0);
        assert_eq!(info.state, CollectionState::Created);
    }

    #[test]
    fn test_invalid_schema() {
        assert!(matches!(
            Collection::in_memory("c", CollectionSchema::new(0), CollectionOptions::default()),
            Err(RetrievalError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_persistent_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c");
        let options = CollectionOptions {
            checkpoint_interval: 2,
            ..CollectionOptions::default()
        };
        {
            let c = Collection::create(&path, "c", schema().with_nlist(2), options).unwrap();
            for i in 0..5 {
                c.insert(Vector::new(vec![i as f32, 1.0, 0.0, 0.0])).unwrap();
            }
            c.build_index(&params(), None).unwrap();
            c.insert(Vector::new(vec![9.0, 1.0, 0.0, 0.0])).unwrap();
            c.tombstone(2).unwrap();
        }

        let c = Collection::open(&path, options).unwrap();
        let info = c.info();
        assert_eq!(info.name, "c");
        assert_eq!(info.state, CollectionState::IndexBuilt);
        assert_eq!(info.vector_count, 6);
        assert_eq!(info.tombstoned, 1);
        assert_eq!(c.live_ids(), vec![0, 1, 3, 4, 5]);
        assert_eq!(c.insert(Vector::new(vec![0.0, 0.0, 1.0, 0.0])).unwrap(), 6);
    }

    #[test]
    fn test_drop_removes_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c");
        let c = Collection::create(&path, "c", schema(), CollectionOptions::default()).unwrap();
        assert!(path.exists());
        c.mark_dropped().unwrap();
        assert!(!path.exists());
    }
}
