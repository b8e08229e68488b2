//! Identifier correlator: durable VectorID → external name mapping.
//!
//! Records are namespaced by collection name. Each namespace has its own
//! lock and its own append-only log at `<root>/<namespace>/correlation.log`,
//! so writers in one collection never contend with another. A record is
//! fsynced before `record` returns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, RetrievalError};
use crate::persistence::wal::{CorrelationRecord, WriteAheadLog};
use crate::vector::VectorId;

pub const CORRELATION_FILE: &str = "correlation.log";

/// Outcome of resolving one VectorID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupEntry {
    /// The id resolved to this external name.
    Found(String),
    /// No record exists for the id.
    Dangling(VectorId),
}

impl LookupEntry {
    pub fn name(&self) -> Option<&str> {
        match self {
            LookupEntry::Found(name) => Some(name),
            LookupEntry::Dangling(_) => None,
        }
    }

    pub fn is_dangling(&self) -> bool {
        matches!(self, LookupEntry::Dangling(_))
    }

    /// Convert into a `DanglingReference` error for callers that surface it.
    pub fn into_result(self, collection: &str) -> Result<String> {
        match self {
            LookupEntry::Found(name) => Ok(name),
            LookupEntry::Dangling(id) => Err(RetrievalError::DanglingReference {
                collection: collection.to_string(),
                id,
            }),
        }
    }
}

/// A store of correlation records. The built-in [`Correlator`] implements
/// it; an external metadata service can too.
pub trait CorrelationStore: Send + Sync {
    /// Durably append `id → name`. Fails with `DuplicateVectorId` if `id`
    /// already has a record; existing records are never overwritten.
    fn record(&self, namespace: &str, id: VectorId, name: &str) -> Result<()>;

    /// Resolve ids, preserving input order. Unknown ids yield `Dangling`.
    fn lookup(&self, namespace: &str, ids: &[VectorId]) -> Result<Vec<LookupEntry>>;

    /// Every recorded id in the namespace, ascending.
    fn recorded_ids(&self, namespace: &str) -> Result<Vec<VectorId>>;

    /// Remove a namespace and all of its records.
    fn drop_namespace(&self, namespace: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct Namespace {
    records: HashMap<VectorId, String>,
    log: Option<WriteAheadLog<CorrelationRecord>>,
}

/// The built-in correlator. Durable when given a root directory,
/// in-memory otherwise.
#[derive(Debug, Default)]
pub struct Correlator {
    root: Option<PathBuf>,
    namespaces: RwLock<HashMap<String, Arc<RwLock<Namespace>>>>,
}

impl Correlator {
    /// A correlator whose records live only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A durable correlator rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: Some(root),
            namespaces: RwLock::new(HashMap::new()),
        })
    }

    fn log_path(&self, namespace: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(namespace).join(CORRELATION_FILE))
    }

    /// Fetch a namespace, loading it from disk on first use.
    fn namespace(&self, name: &str) -> Result<Arc<RwLock<Namespace>>> {
        if let Some(ns) = self.namespaces.read().get(name) {
            return Ok(Arc::clone(ns));
        }

        let mut namespaces = self.namespaces.write();
        if let Some(ns) = namespaces.get(name) {
            return Ok(Arc::clone(ns));
        }

        let mut state = Namespace::default();
        // Reads never create files; the log appears on the first record.
        if let Some(path) = self.log_path(name).filter(|p| p.exists()) {
            let log: WriteAheadLog<CorrelationRecord> = WriteAheadLog::open(&path)?;
            for record in log.replay()? {
                if let Some(existing) = state.records.get(&record.vector_id) {
                    warn!(
                        namespace = name,
                        id = record.vector_id,
                        kept = %existing,
                        ignored = %record.name,
                        "duplicate correlation record in log"
                    );
                    continue;
                }
                state.records.insert(record.vector_id, record.name);
            }
            debug!(namespace = name, records = state.records.len(), "loaded correlation namespace");
            state.log = Some(log);
        }

        let ns = Arc::new(RwLock::new(state));
        namespaces.insert(name.to_string(), Arc::clone(&ns));
        Ok(ns)
    }

    /// Number of records in a namespace.
    pub fn len(&self, namespace: &str) -> Result<usize> {
        Ok(self.namespace(namespace)?.read().records.len())
    }
}

impl CorrelationStore for Correlator {
    fn record(&self, namespace: &str, id: VectorId, name: &str) -> Result<()> {
        let ns = self.namespace(namespace)?;
        let mut state = ns.write();
        if state.records.contains_key(&id) {
            return Err(RetrievalError::DuplicateVectorId {
                collection: namespace.to_string(),
                id,
            });
        }
        if state.log.is_none() {
            if let Some(path) = self.log_path(namespace) {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                state.log = Some(WriteAheadLog::open(&path)?);
            }
        }
        if let Some(log) = state.log.as_mut() {
            log.append(&CorrelationRecord {
                vector_id: id,
                name: name.to_string(),
            })?;
        }
        state.records.insert(id, name.to_string());
        Ok(())
    }

    fn lookup(&self, namespace: &str, ids: &[VectorId]) -> Result<Vec<LookupEntry>> {
        let ns = self.namespace(namespace)?;
        let state = ns.read();
        Ok(ids
            .iter()
            .map(|id| match state.records.get(id) {
                Some(name) => LookupEntry::Found(name.clone()),
                None => LookupEntry::Dangling(*id),
            })
            .collect())
    }

    fn recorded_ids(&self, namespace: &str) -> Result<Vec<VectorId>> {
        let ns = self.namespace(namespace)?;
        let mut ids: Vec<VectorId> = ns.read().records.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn drop_namespace(&self, namespace: &str) -> Result<()> {
        let removed = self.namespaces.write().remove(namespace);
        if let Some(ns) = removed {
            // Close the log before deleting it.
            ns.write().log = None;
        }
        if let Some(path) = self.log_path(namespace) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
