//! Storage engine: combines WAL + snapshots for crash-safe persistence of one collection.

use crate::error::Result;
use crate::persistence::serialization::CollectionSnapshot;
use crate::persistence::snapshot::SnapshotManager;
use crate::persistence::wal::{IndexLogEntry, WriteAheadLog};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const WAL_FILE: &str = "wal.log";

/// State read back from disk when a collection is opened.
#[derive(Debug)]
pub struct Recovered {
    pub snapshot: Option<CollectionSnapshot>,
    /// Mutations logged after `snapshot` was taken, in order.
    pub entries: Vec<IndexLogEntry>,
}

/// Persistent storage for one collection directory.
#[derive(Debug)]
pub struct StorageEngine {
    dir: PathBuf,
    wal: WriteAheadLog<IndexLogEntry>,
    snapshot_mgr: SnapshotManager,
    wal_count: usize,
    checkpoint_interval: usize,
}

impl StorageEngine {
    /// Open or create the collection directory and read back its state.
    pub fn open(dir: impl AsRef<Path>, checkpoint_interval: usize) -> Result<(Self, Recovered)> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let snapshot_mgr = SnapshotManager::new(&dir)?;
        let wal: WriteAheadLog<IndexLogEntry> = WriteAheadLog::open(dir.join(WAL_FILE))?;

        let snapshot = snapshot_mgr.load()?;
        let entries = wal.replay()?;
        debug!(
            dir = %dir.display(),
            snapshot = snapshot.is_some(),
            wal_entries = entries.len(),
            "opened collection storage"
        );

        let engine = Self {
            dir,
            wal,
            snapshot_mgr,
            wal_count: entries.len(),
            checkpoint_interval: checkpoint_interval.max(1),
        };
        Ok((engine, Recovered { snapshot, entries }))
    }

    /// Durably append a mutation.
    pub fn log(&mut self, entry: &IndexLogEntry) -> Result<()> {
        self.wal.append(entry)?;
        self.wal_count += 1;
        Ok(())
    }

    /// Whether enough mutations have accumulated to warrant a snapshot.
    pub fn should_checkpoint(&self) -> bool {
        self.wal_count >= self.checkpoint_interval
    }

    /// Write a full snapshot, then truncate the WAL.
    pub fn checkpoint(&mut self, snapshot: &CollectionSnapshot) -> Result<()> {
        self.snapshot_mgr.save(snapshot)?;
        self.wal.truncate()?;
        self.wal_count = 0;
        debug!(dir = %self.dir.display(), "checkpointed collection");
        Ok(())
    }

    /// Delete the collection directory and everything in it.
    pub fn destroy(self) -> Result<()> {
        let dir = self.dir;
        drop(self.wal);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionSchema;
    use crate::ivf::IvfIndex;
    use crate::vector::Vector;
    use tempfile::TempDir;

    fn snapshot_of(index: &IvfIndex) -> CollectionSnapshot {
        CollectionSnapshot {
            name: "c".to_string(),
            schema: CollectionSchema::new(index.dimension()),
            index: index.to_snapshot(),
        }
    }

    #[test]
    fn test_log_and_recover() {
        let dir = TempDir::new().unwrap();
        {
            let (mut engine, recovered) = StorageEngine::open(dir.path().join("c"), 100).unwrap();
            assert!(recovered.snapshot.is_none());
            assert!(recovered.entries.is_empty());
            engine
                .log(&IndexLogEntry::Insert {
                    id: 0,
                    data: vec![1.0, 2.0],
                })
                .unwrap();
        }

        let (_, recovered) = StorageEngine::open(dir.path().join("c"), 100).unwrap();
        assert_eq!(recovered.entries.len(), 1);
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = TempDir::new().unwrap();
        let mut index = IvfIndex::new(2, crate::distance::Metric::L2);
        {
            let (mut engine, _) = StorageEngine::open(dir.path().join("c"), 2).unwrap();
            for _ in 0..2 {
                let id = index.insert(Vector::new(vec![1.0, 0.0])).unwrap();
                engine
                    .log(&IndexLogEntry::Insert {
                        id,
                        data: vec![1.0, 0.0],
                    })
                    .unwrap();
            }
            assert!(engine.should_checkpoint());
            engine.checkpoint(&snapshot_of(&index)).unwrap();
            assert!(!engine.should_checkpoint());
        }

        let (_, recovered) = StorageEngine::open(dir.path().join("c"), 2).unwrap();
        assert!(recovered.entries.is_empty());
        assert_eq!(recovered.snapshot.unwrap().index.next_id, 2);
    }

    #[test]
    fn test_destroy_removes_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c");
        let (engine, _) = StorageEngine::open(&path, 10).unwrap();
        assert!(path.exists());
        engine.destroy().unwrap();
        assert!(!path.exists());
    }
}
