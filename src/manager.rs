//! Collection manager: lifecycle of named collections and their correlation namespaces.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::collection::{Collection, CollectionSchema};
use crate::config::EngineConfig;
use crate::correlator::{CorrelationStore, Correlator};
use crate::error::{Result, RetrievalError};
use crate::ivf::KMeansParams;
use crate::persistence::snapshot::SNAPSHOT_FILE;

/// Owns every collection plus the correlator they share.
pub struct CollectionManager {
    data_dir: Option<PathBuf>,
    config: EngineConfig,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    correlator: Arc<dyn CorrelationStore>,
}

impl std::fmt::Debug for CollectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionManager")
            .field("data_dir", &self.data_dir)
            .field("collections", &self.list())
            .finish()
    }
}

/// Outcome of checking one collection against its correlation namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Ids held by the index with no record; now tombstoned.
    pub orphans_tombstoned: Vec<u64>,
    /// Records whose id the index does not hold.
    pub stray_records: Vec<u64>,
}

impl CollectionManager {
    /// Open the manager described by `config`: durable if it names a data
    /// directory, in-memory otherwise.
    pub fn open(config: EngineConfig) -> Result<Self> {
        match config.data_dir.clone() {
            Some(dir) => {
                let correlator = Arc::new(Correlator::open(&dir)?);
                Self::open_with_store(config, correlator)
            }
            None => Ok(Self::in_memory_with_store(
                config,
                Arc::new(Correlator::in_memory()),
            )),
        }
    }

    /// An in-memory manager with an external correlation store.
    pub fn in_memory_with_store(config: EngineConfig, correlator: Arc<dyn CorrelationStore>) -> Self {
        Self {
            data_dir: None,
            config,
            collections: RwLock::new(HashMap::new()),
            correlator,
        }
    }

    /// Open every collection under `config.data_dir`, then reconcile each
    /// against `correlator`.
    pub fn open_with_store(config: EngineConfig, correlator: Arc<dyn CorrelationStore>) -> Result<Self> {
        let mut collections = HashMap::new();
        let options = config.collection_options();
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)?;
            for path in collection_dirs(dir)? {
                let collection = Collection::open(&path, options)?;
                collections.insert(collection.name().to_string(), Arc::new(collection));
            }
        }

        let manager = Self {
            data_dir: config.data_dir.clone(),
            config,
            collections: RwLock::new(collections),
            correlator,
        };
        for name in manager.list() {
            manager.reconcile(&name)?;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Arc<dyn CorrelationStore> {
        &self.correlator
    }

    /// Clustering parameters from the engine configuration.
    pub fn kmeans_params(&self) -> KMeansParams {
        self.config.kmeans_params()
    }

    fn collection_dir(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(name))
    }

    /// Create a collection, or return the existing one with that name.
    pub fn create(&self, name: &str, schema: CollectionSchema) -> Result<Arc<Collection>> {
        validate_name(name)?;
        schema.validate()?;

        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(name) {
            if existing.schema() != schema {
                warn!(
                    collection = name,
                    existing = ?existing.schema(),
                    requested = ?schema,
                    "collection exists with a different schema; keeping the existing one"
                );
            }
            return Ok(Arc::clone(existing));
        }

        if schema.norm == crate::normalize::Norm::L1
            && schema.metric == crate::distance::Metric::InnerProduct
        {
            warn!(
                collection = name,
                "inner product over L1-normalized vectors is not cosine similarity; use norm l2 for cosine"
            );
        }

        let options = self.config.collection_options();
        let collection = match self.collection_dir(name) {
            Some(dir) => Collection::create(&dir, name, schema, options)?,
            None => Collection::in_memory(name, schema, options)?,
        };
        let collection = Arc::new(collection);
        collections.insert(name.to_string(), Arc::clone(&collection));
        info!(collection = name, dimension = schema.dimension, metric = %schema.metric, "created collection");
        Ok(collection)
    }

    /// Look up a collection by name.
    pub fn get(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RetrievalError::CollectionNotFound {
                name: name.to_string(),
            })
    }

    /// Drop a collection: its index, its on-disk state, and its correlation namespace.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let collection = self
            .collections
            .write()
            .remove(name)
            .ok_or_else(|| RetrievalError::CollectionNotFound {
                name: name.to_string(),
            })?;
        // Refuse new inserts before the names they would record are released.
        collection.mark_dropped()?;
        self.correlator.drop_namespace(name)?;
        info!(collection = name, "dropped collection");
        Ok(())
    }

    /// Names of every collection, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Restore the one-record-per-id invariant after a restart.
    ///
    /// An id without a record means a crash landed between the two insert
    /// phases; it is tombstoned. A record without an id is only reported.
    pub fn reconcile(&self, name: &str) -> Result<Reconciliation> {
        let collection = self.get(name)?;
        let live = collection.live_ids();
        let recorded: HashSet<u64> = self.correlator.recorded_ids(name)?.into_iter().collect();

        let mut report = Reconciliation::default();
        for &id in &live {
            if !recorded.contains(&id) && collection.tombstone(id)? {
                report.orphans_tombstoned.push(id);
            }
        }
        let live: HashSet<u64> = live.into_iter().collect();
        let mut stray: Vec<u64> = recorded.into_iter().filter(|id| !live.contains(id)).collect();
        stray.sort_unstable();
        if !stray.is_empty() {
            warn!(collection = name, count = stray.len(), "correlation records without indexed vectors");
        }
        report.stray_records = stray;
        if !report.orphans_tombstoned.is_empty() {
            warn!(
                collection = name,
                count = report.orphans_tombstoned.len(),
                "tombstoned vectors left without correlation records"
            );
        }
        Ok(report)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(RetrievalError::invalid_parameter(format!(
            "collection name '{name}' must be non-empty and use only letters, digits, '_', '-' or '.'"
        )))
    }
}

/// Subdirectories of `dir` holding a collection snapshot.
fn collection_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .filter(|path| path.join(SNAPSHOT_FILE).exists())
        .collect();
    dirs.sort();
    Ok(dirs)
}
