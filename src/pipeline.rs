//! Retrieval pipeline: normalize → index → correlate on ingest,
//! normalize → search → resolve names on query.
//!
//! Ingestion follows a two-phase protocol. The collection assigns a
//! VectorID and commits the vector first; the correlator then records the
//! name. If the second phase fails, the configured [`RecoveryPolicy`]
//! decides what happens, and either way the id ends up correlated or
//! tombstoned.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::collection::{Collection, CollectionSchema};
use crate::correlator::LookupEntry;
use crate::error::{Result, RetrievalError};
use crate::ivf::BuildStats;
use crate::manager::CollectionManager;
use crate::metrics::MetricsCollector;
use crate::normalize::normalize;
use crate::vector::{Vector, VectorId};

/// What to do when a vector was indexed but its name could not be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Tombstone the id so no search ever returns it.
    TombstoneOrphans,
    /// Retry storage failures up to `max_attempts` more times, then tombstone.
    RetryToConvergence { max_attempts: u32 },
}

/// An item that was indexed and correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    /// Position in the submitted batch.
    pub position: usize,
    pub name: String,
    pub id: VectorId,
}

/// An item that did not make it in.
#[derive(Debug)]
pub struct ItemFailure {
    pub position: usize,
    pub name: String,
    pub error: RetrievalError,
    /// Set when the vector was indexed and then tombstoned.
    pub orphan: Option<VectorId>,
}

/// Per-item results of a batch ingest.
#[derive(Debug)]
pub struct IngestReport {
    pub collection: String,
    pub inserted: Vec<Inserted>,
    pub failures: Vec<ItemFailure>,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Ids that were indexed and then tombstoned.
    pub fn orphans(&self) -> Vec<VectorId> {
        self.failures.iter().filter_map(|f| f.orphan).collect()
    }
}

/// One ranked hit with its resolved name.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub vector_id: VectorId,
    pub score: f32,
    pub entry: LookupEntry,
}

/// Result of one query in a batch.
#[derive(Debug)]
pub struct QueryOutcome {
    pub position: usize,
    pub result: Result<Vec<Match>>,
}

/// Split a batch into the items `schema` would accept and those it would
/// reject, without touching any collection.
///
/// Kept items are returned unnormalized, in batch order. Rejections carry
/// their position in the submitted batch.
pub fn screen(
    schema: &CollectionSchema,
    items: Vec<(String, Vector)>,
) -> (Vec<(String, Vector)>, Vec<ItemFailure>) {
    let mut usable = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for (position, (name, vector)) in items.into_iter().enumerate() {
        let check = vector
            .check_dimension(schema.dimension)
            .and_then(|()| normalize(&vector, schema.norm).map(drop));
        match check {
            Ok(()) => usable.push((name, vector)),
            Err(error) => rejected.push(ItemFailure {
                position,
                name,
                error,
                orphan: None,
            }),
        }
    }
    (usable, rejected)
}

/// Orchestrates ingestion and retrieval over a [`CollectionManager`].
pub struct RetrievalPipeline {
    manager: Arc<CollectionManager>,
    recovery: RecoveryPolicy,
    metrics: Mutex<MetricsCollector>,
}

impl RetrievalPipeline {
    /// A pipeline using the manager's configured recovery policy.
    pub fn new(manager: Arc<CollectionManager>) -> Self {
        let recovery = manager.config().recovery;
        Self {
            manager,
            recovery,
            metrics: Mutex::new(MetricsCollector::new()),
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn manager(&self) -> &Arc<CollectionManager> {
        &self.manager
    }

    pub fn metrics(&self) -> MutexGuard<'_, MetricsCollector> {
        self.metrics.lock()
    }

    /// Normalize and insert a batch of named vectors.
    ///
    /// Only a missing collection fails the call; everything else is
    /// reported per item and the batch continues.
    pub fn ingest(&self, collection: &str, items: Vec<(String, Vector)>) -> Result<IngestReport> {
        let target = self.manager.get(collection)?;
        let mut report = IngestReport {
            collection: collection.to_string(),
            inserted: Vec::with_capacity(items.len()),
            failures: Vec::new(),
        };

        for (position, (name, vector)) in items.into_iter().enumerate() {
            match self.ingest_one(&target, &name, &vector) {
                Ok(id) => {
                    self.metrics.lock().record_insert();
                    report.inserted.push(Inserted { position, name, id });
                }
                Err((error, orphan)) => {
                    warn!(collection, position, name = %name, error = %error, "ingest failed");
                    self.metrics.lock().record_failed_insert();
                    report.failures.push(ItemFailure {
                        position,
                        name,
                        error,
                        orphan,
                    });
                }
            }
        }

        info!(
            collection,
            inserted = report.inserted.len(),
            failed = report.failures.len(),
            "ingest finished"
        );
        Ok(report)
    }

    fn ingest_one(
        &self,
        collection: &Collection,
        name: &str,
        vector: &Vector,
    ) -> std::result::Result<VectorId, (RetrievalError, Option<VectorId>)> {
        let normalized = normalize(vector, collection.schema().norm).map_err(|e| (e, None))?;
        let id = collection.insert(normalized).map_err(|e| (e, None))?;

        let correlator = self.manager.correlator();
        let mut failure = match correlator.record(collection.name(), id, name) {
            Ok(()) => return Ok(id),
            Err(e) => e,
        };

        if let RecoveryPolicy::RetryToConvergence { max_attempts } = self.recovery {
            let mut attempt = 0;
            while attempt < max_attempts && failure.is_storage() {
                attempt += 1;
                debug!(collection = collection.name(), id, attempt, "retrying correlation record");
                match correlator.record(collection.name(), id, name) {
                    Ok(()) => return Ok(id),
                    // An earlier attempt may have landed before reporting failure.
                    Err(RetrievalError::DuplicateVectorId { .. })
                        if self.recorded_as(collection.name(), id, name) =>
                    {
                        return Ok(id)
                    }
                    Err(e) => failure = e,
                }
            }
        }

        if let Err(e) = collection.tombstone(id) {
            error!(
                collection = collection.name(),
                id,
                error = %e,
                "failed to persist tombstone; the orphan will be reconciled on reopen"
            );
        }
        self.metrics.lock().record_orphan();
        Err((failure, Some(id)))
    }

    fn recorded_as(&self, collection: &str, id: VectorId, name: &str) -> bool {
        matches!(
            self.manager.correlator().lookup(collection, &[id]).as_deref(),
            Ok([LookupEntry::Found(found)]) if found == name
        )
    }

    /// Cluster a collection with the configured parameters and make it searchable.
    pub fn build_and_load(&self, collection: &str) -> Result<BuildStats> {
        let target = self.manager.get(collection)?;
        let stats = target.build_index(&self.manager.kmeans_params(), None)?;
        target.load()?;
        Ok(stats)
    }

    /// Run one query and resolve its hits to names, rank order preserved.
    pub fn query_one(
        &self,
        collection: &str,
        query: &Vector,
        top_k: usize,
        nprobe: Option<usize>,
    ) -> Result<Vec<Match>> {
        let target = self.manager.get(collection)?;
        self.run_query(&target, query, top_k, nprobe)
    }

    /// Run a batch of queries in parallel. Each query succeeds or fails on
    /// its own; only a missing collection fails the call.
    pub fn query(
        &self,
        collection: &str,
        queries: &[Vector],
        top_k: usize,
        nprobe: Option<usize>,
    ) -> Result<Vec<QueryOutcome>> {
        let target = self.manager.get(collection)?;
        Ok(queries
            .par_iter()
            .enumerate()
            .map(|(position, query)| QueryOutcome {
                position,
                result: self.run_query(&target, query, top_k, nprobe),
            })
            .collect())
    }

    fn run_query(
        &self,
        collection: &Collection,
        query: &Vector,
        top_k: usize,
        nprobe: Option<usize>,
    ) -> Result<Vec<Match>> {
        let started = Instant::now();
        let normalized = normalize(query, collection.schema().norm)?;
        let hits = collection.search(&normalized, top_k, nprobe)?;

        let ids: Vec<VectorId> = hits.iter().map(|h| h.id).collect();
        let entries = self.manager.correlator().lookup(collection.name(), &ids)?;

        let matches: Vec<Match> = hits
            .into_iter()
            .zip(entries)
            .map(|(hit, entry)| Match {
                vector_id: hit.id,
                score: hit.score,
                entry,
            })
            .collect();

        let dangling = matches.iter().filter(|m| m.entry.is_dangling()).count() as u64;
        let mut metrics = self.metrics.lock();
        metrics.record_query(started.elapsed());
        if dangling > 0 {
            warn!(collection = collection.name(), dangling, "search returned ids without records");
            metrics.record_dangling(dangling);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionSchema;
    use crate::config::EngineConfig;
    use crate::correlator::{CorrelationStore, Correlator};
    use crate::distance::Metric;
    use crate::normalize::Norm;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Wraps a correlator and fails the first `failures` writes.
    struct FlakyStore {
        inner: Correlator,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn failing(times: u32) -> Self {
            Self {
                inner: Correlator::in_memory(),
                failures: AtomicU32::new(times),
            }
        }
    }

    impl CorrelationStore for FlakyStore {
        fn record(&self, namespace: &str, id: VectorId, name: &str) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(RetrievalError::StorageFailure(std::io::Error::other("disk full")));
            }
            self.inner.record(namespace, id, name)
        }

        fn lookup(&self, namespace: &str, ids: &[VectorId]) -> Result<Vec<LookupEntry>> {
            self.inner.lookup(namespace, ids)
        }

        fn recorded_ids(&self, namespace: &str) -> Result<Vec<VectorId>> {
            self.inner.recorded_ids(namespace)
        }

        fn drop_namespace(&self, namespace: &str) -> Result<()> {
            self.inner.drop_namespace(namespace)
        }
    }

    fn pipeline_with(store: Arc<dyn CorrelationStore>, recovery: RecoveryPolicy) -> RetrievalPipeline {
        let manager = CollectionManager::in_memory_with_store(EngineConfig::default(), store);
        manager
            .create(
                "images",
                CollectionSchema::new(2)
                    .with_nlist(1)
                    .with_norm(Norm::L2)
                    .with_metric(Metric::InnerProduct),
            )
            .unwrap();
        RetrievalPipeline::new(Arc::new(manager)).with_recovery(recovery)
    }

    fn items() -> Vec<(String, Vector)> {
        vec![
            ("a.jpg".to_string(), Vector::new(vec![1.0, 0.0])),
            ("b.jpg".to_string(), Vector::new(vec![0.0, 1.0])),
            ("c.jpg".to_string(), Vector::new(vec![1.0, 1.0])),
        ]
    }

    #[test]
    fn test_partial_failure_is_reported() {
        let p = pipeline_with(Arc::new(Correlator::in_memory()), RecoveryPolicy::TombstoneOrphans);
        let mut batch = items();
        batch.insert(1, ("zero.jpg".to_string(), Vector::new(vec![0.0, 0.0])));
        batch.push(("wide.jpg".to_string(), Vector::new(vec![1.0, 2.0, 3.0])));

        let report = p.ingest("images", batch).unwrap();
        assert_eq!(report.inserted.len(), 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].position, 1);
        assert!(matches!(report.failures[0].error, RetrievalError::DegenerateVector));
        assert!(matches!(
            report.failures[1].error,
            RetrievalError::DimensionMismatch { .. }
        ));
        assert!(report.orphans().is_empty());
    }

    #[test]
    fn test_missing_collection_aborts() {
        let p = pipeline_with(Arc::new(Correlator::in_memory()), RecoveryPolicy::TombstoneOrphans);
        assert!(matches!(
            p.ingest("other", items()),
            Err(RetrievalError::CollectionNotFound { .. })
        ));
    }

    #[test]
    fn test_tombstone_policy_hides_orphan() {
        let p = pipeline_with(Arc::new(FlakyStore::failing(1)), RecoveryPolicy::TombstoneOrphans);
        let report = p.ingest("images", items()).unwrap();
        assert_eq!(report.orphans(), vec![0]);
        assert!(report.failures[0].error.is_storage());

        p.build_and_load("images").unwrap();
        let hits = p
            .query_one("images", &Vector::new(vec![1.0, 0.0]), 10, None)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|m| m.vector_id != 0 && !m.entry.is_dangling()));
        assert_eq!(p.metrics().orphans_tombstoned(), 1);
    }

    #[test]
    fn test_retry_policy_converges() {
        let p = pipeline_with(
            Arc::new(FlakyStore::failing(2)),
            RecoveryPolicy::RetryToConvergence { max_attempts: 3 },
        );
        let report = p.ingest("images", items()).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.inserted.len(), 3);
    }

    #[test]
    fn test_retry_policy_falls_back_to_tombstone() {
        let p = pipeline_with(
            Arc::new(FlakyStore::failing(4)),
            RecoveryPolicy::RetryToConvergence { max_attempts: 1 },
        );
        let report = p.ingest("images", items()).unwrap();
        // Each of the first two items fails once and then fails its single retry.
        assert_eq!(report.orphans(), vec![0, 1]);
        assert_eq!(report.inserted.len(), 1);
    }

    #[test]
    fn test_query_preserves_rank_and_names() {
        let p = pipeline_with(Arc::new(Correlator::in_memory()), RecoveryPolicy::TombstoneOrphans);
        p.ingest("images", items()).unwrap();
        p.build_and_load("images").unwrap();

        let outcomes = p
            .query(
                "images",
                &[Vector::new(vec![2.0, 0.1]), Vector::new(vec![0.0, 0.0])],
                2,
                None,
            )
            .unwrap();
        let first = outcomes[0].result.as_ref().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].entry.name(), Some("a.jpg"));
        assert_eq!(first[1].entry.name(), Some("c.jpg"));
        assert!(first[0].score >= first[1].score);
        assert!(matches!(
            outcomes[1].result,
            Err(RetrievalError::DegenerateVector)
        ));
    }

    #[test]
    fn test_dangling_hits_are_marked_not_dropped() {
        let p = pipeline_with(Arc::new(Correlator::in_memory()), RecoveryPolicy::TombstoneOrphans);
        let collection = p.manager().get("images").unwrap();
        // Bypass the pipeline so no record is written.
        collection.insert(Vector::new(vec![1.0, 0.0])).unwrap();
        collection.load().unwrap();

        let hits = p
            .query_one("images", &Vector::new(vec![1.0, 0.0]), 5, None)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry, LookupEntry::Dangling(0));
        assert_eq!(p.metrics().dangling_references(), 1);
    }

    #[test]
    fn test_screen_rejects_degenerate_and_misshapen() {
        let schema = CollectionSchema::new(2);
        let (usable, rejected) = screen(
            &schema,
            vec![
                ("a.jpg".to_string(), Vector::new(vec![1.0, 0.0])),
                ("empty.jpg".to_string(), Vector::new(vec![0.0, 0.0])),
                ("wide.jpg".to_string(), Vector::new(vec![1.0, 1.0, 1.0])),
                ("b.jpg".to_string(), Vector::new(vec![0.0, 2.0])),
            ],
        );

        let kept: Vec<&str> = usable.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(kept, vec!["a.jpg", "b.jpg"]);
        assert_eq!(usable[1].1.as_slice(), &[0.0, 2.0]);
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].position, 1);
        assert!(matches!(rejected[0].error, RetrievalError::DegenerateVector));
        assert_eq!(rejected[1].position, 2);
        assert!(matches!(rejected[1].error, RetrievalError::DimensionMismatch { .. }));
    }
}
