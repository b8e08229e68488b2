//! Write-Ahead Log (WAL) for crash recovery.
//!
//! Each entry is written as: [length: u32][crc32: u32][payload: bincode(entry)]
//! The WAL is append-only and fsynced after each write.

use crate::error::{Result, RetrievalError};
use crate::persistence::serialization;
use crate::vector::VectorId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Mutation of a collection's index since its last snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum IndexLogEntry {
    Insert { id: VectorId, data: Vec<f32> },
    Tombstone { id: VectorId },
}

/// A durable VectorID to external name mapping.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CorrelationRecord {
    pub vector_id: VectorId,
    pub name: String,
}

/// Write-Ahead Log file manager, typed by its entry.
///
/// `valid_len` is the end of the last complete frame. Bytes past it are a
/// torn write and are cut off before the next append, so an acknowledged
/// entry never lands behind garbage that replay would stop at.
#[derive(Debug)]
pub struct WriteAheadLog<E> {
    path: PathBuf,
    file: File,
    valid_len: u64,
    poisoned: bool,
    _entry: PhantomData<E>,
}

impl<E: Serialize + DeserializeOwned> WriteAheadLog<E> {
    /// Open (or create) a WAL file at the given path, dropping any torn tail.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (_, valid_len) = scan::<E>(&path)?;
        let mut wal = Self {
            path,
            file,
            valid_len,
            poisoned: false,
            _entry: PhantomData,
        };
        wal.cut_torn_tail()?;
        Ok(wal)
    }

    fn cut_torn_tail(&mut self) -> Result<()> {
        let on_disk = self.file.metadata()?.len();
        if on_disk != self.valid_len {
            warn!(
                path = %self.path.display(),
                valid = self.valid_len,
                on_disk,
                "discarding torn WAL tail"
            );
            self.file.set_len(self.valid_len)?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Append an entry to the WAL and fsync.
    ///
    /// A failed write is rolled back to the previous frame boundary. If the
    /// rollback fails too, the log refuses every later append.
    pub fn append(&mut self, entry: &E) -> Result<()> {
        if self.poisoned {
            return Err(RetrievalError::StorageFailure(std::io::Error::other(format!(
                "{} is unusable after a failed rollback",
                self.path.display()
            ))));
        }
        let payload = serialization::to_bincode(entry)?;
        let crc = crc32fast::hash(&payload);
        let len = payload.len() as u32;

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        if let Err(e) = self.cut_torn_tail() {
            self.poisoned = true;
            return Err(e);
        }
        if let Err(e) = self.file.write_all(&frame).and_then(|()| self.file.sync_all()) {
            if let Err(rollback) = self.file.set_len(self.valid_len).and_then(|()| self.file.sync_all()) {
                error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "WAL rollback failed; refusing further appends"
                );
                self.poisoned = true;
            }
            return Err(e.into());
        }
        self.valid_len += frame.len() as u64;

        Ok(())
    }

    /// Replay all valid entries from the WAL.
    /// Stops at the first corrupted or incomplete entry (crash tolerance).
    pub fn replay(&self) -> Result<Vec<E>> {
        Ok(scan::<E>(&self.path)?.0)
    }

    /// Truncate the WAL file (after a successful checkpoint).
    pub fn truncate(&mut self) -> Result<()> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file.sync_all()?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.valid_len = 0;
        self.poisoned = false;
        Ok(())
    }
}

/// Read every complete frame, returning the entries and the byte offset
/// where the valid prefix ends.
fn scan<E: DeserializeOwned>(path: &Path) -> Result<(Vec<E>, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset: u64 = 0;

    loop {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(RetrievalError::StorageFailure(e)),
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if offset + 8 + len > file_len {
            break; // torn write
        }

        let mut payload = vec![0u8; len as usize];
        if reader.read_exact(&mut payload).is_err() {
            break;
        }
        if crc32fast::hash(&payload) != expected_crc {
            warn!(path = %path.display(), offset, "stopping WAL replay at corrupt entry");
            break;
        }
        match serialization::from_bincode::<E>(&payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        offset += 8 + len;
    }

    Ok((entries, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = WriteAheadLog::open(&wal_path).unwrap();
            wal.append(&IndexLogEntry::Insert {
                id: 0,
                data: vec![1.0, 2.0, 3.0],
            })
            .unwrap();
            wal.append(&IndexLogEntry::Insert {
                id: 1,
                data: vec![4.0, 5.0, 6.0],
            })
            .unwrap();
            wal.append(&IndexLogEntry::Tombstone { id: 0 }).unwrap();
        }

        let wal = WriteAheadLog::<IndexLogEntry>::open(&wal_path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 3);

        assert!(matches!(&entries[0], IndexLogEntry::Insert { id: 0, .. }));
        assert!(matches!(&entries[1], IndexLogEntry::Insert { id: 1, .. }));
        assert_eq!(entries[2], IndexLogEntry::Tombstone { id: 0 });
    }

    #[test]
    fn test_wal_truncated_entry() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = WriteAheadLog::open(&wal_path).unwrap();
            wal.append(&CorrelationRecord {
                vector_id: 0,
                name: "cat.jpg".to_string(),
            })
            .unwrap();
        }

        // Append garbage (simulates a crash mid-write)
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&[0xFF, 0xFF, 0xFF]).unwrap();
        }

        let wal = WriteAheadLog::<CorrelationRecord>::open(&wal_path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "cat.jpg");
    }

    #[test]
    fn test_wal_corrupt_crc_stops_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");
        {
            let mut wal = WriteAheadLog::open(&wal_path).unwrap();
            wal.append(&IndexLogEntry::Tombstone { id: 4 }).unwrap();
            wal.append(&IndexLogEntry::Tombstone { id: 5 }).unwrap();
        }
        let mut bytes = std::fs::read(&wal_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xAA;
        std::fs::write(&wal_path, &bytes).unwrap();

        let wal = WriteAheadLog::<IndexLogEntry>::open(&wal_path).unwrap();
        assert_eq!(wal.replay().unwrap(), vec![IndexLogEntry::Tombstone { id: 4 }]);
    }

    #[test]
    fn test_wal_truncate() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        let mut wal = WriteAheadLog::open(&wal_path).unwrap();
        wal.append(&IndexLogEntry::Tombstone { id: 1 }).unwrap();
        assert_eq!(wal.replay().unwrap().len(), 1);

        wal.truncate().unwrap();
        wal.append(&IndexLogEntry::Tombstone { id: 2 }).unwrap();

        let wal = WriteAheadLog::<IndexLogEntry>::open(&wal_path).unwrap();
        assert_eq!(wal.replay().unwrap(), vec![IndexLogEntry::Tombstone { id: 2 }]);
    }

    #[test]
    fn test_append_after_torn_bytes_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("correlation.log");
        let record = |id: u64| CorrelationRecord {
            vector_id: id,
            name: format!("{id}.jpg"),
        };

        let mut wal = WriteAheadLog::open(&wal_path).unwrap();
        wal.append(&record(0)).unwrap();
        // A write that died partway through its frame.
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&[0x20, 0x00, 0x00, 0x00, 0x7F]).unwrap();
        }
        wal.append(&record(1)).unwrap();
        wal.append(&record(2)).unwrap();
        drop(wal);

        let wal = WriteAheadLog::<CorrelationRecord>::open(&wal_path).unwrap();
        let ids: Vec<u64> = wal.replay().unwrap().iter().map(|r| r.vector_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_open_discards_torn_tail() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");
        {
            let mut wal = WriteAheadLog::open(&wal_path).unwrap();
            wal.append(&IndexLogEntry::Tombstone { id: 1 }).unwrap();
        }
        let clean_len = std::fs::metadata(&wal_path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&[0xFF; 6]).unwrap();
        }

        let mut wal = WriteAheadLog::<IndexLogEntry>::open(&wal_path).unwrap();
        assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), clean_len);
        wal.append(&IndexLogEntry::Tombstone { id: 2 }).unwrap();
        assert_eq!(
            wal.replay().unwrap(),
            vec![IndexLogEntry::Tombstone { id: 1 }, IndexLogEntry::Tombstone { id: 2 }]
        );
    }
}
