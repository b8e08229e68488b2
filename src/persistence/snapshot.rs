//! Snapshot: save/load full collection state to/from disk.

use crate::error::Result;
use crate::persistence::serialization::{self, CollectionSnapshot};
use std::fs;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_FILE: &str = "snapshot.bin";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Manages saving and loading collection snapshots.
#[derive(Debug)]
pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    /// Create a snapshot manager for the given directory.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Save a snapshot to disk. The previous snapshot stays intact until
    /// the new one is fully written.
    pub fn save(&self, snapshot: &CollectionSnapshot) -> Result<()> {
        let data = serialization::to_bincode(snapshot)?;
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        fs::write(&tmp, &data)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, self.snapshot_path())?;

        // Human-readable metadata
        let manifest = serde_json::json!({
            "name": snapshot.name,
            "schema": snapshot.schema,
            "index_built": !snapshot.index.centroids.is_empty(),
            "vector_count": snapshot.index.lists.iter().map(|l| l.ids.len()).sum::<usize>()
                + snapshot.index.pending.len(),
            "tombstoned": snapshot.index.tombstones.len(),
            "next_id": snapshot.index.next_id,
        });
        fs::write(self.manifest_path(), serialization::to_json(&manifest)?)?;

        Ok(())
    }

    /// Load a snapshot from disk, or return None if no snapshot exists.
    pub fn load(&self) -> Result<Option<CollectionSnapshot>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        let snapshot: CollectionSnapshot = serialization::from_bincode(&data)?;
        Ok(Some(snapshot))
    }

    /// Check if a snapshot exists.
    pub fn exists(&self) -> bool {
        self.snapshot_path().exists()
    }
}
