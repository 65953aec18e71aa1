//! File-backed partition-state store
//!
//! One JSON document per partition:
//!
//! ```text
//! state_dir/
//!   shop.orders.json   {"version": 3, "record": {...}}
//!   shop.audit.json
//! ```
//!
//! Writes go to a temp file that is fsynced and renamed over the target.
//! Each conditional write holds an exclusive OS lock on `{key}.lock` from
//! the version read to the rename, so any number of store instances and
//! processes sharing one host directory see atomic compare-and-set. The
//! lock does not extend across hosts or network filesystems.

use super::{validate_store_key, PartitionStateStore, Version, Versioned, WriteOutcome};
use crate::error::{IngestError, Result};
use crate::partition::PartitionRecord;
use crate::types::PartitionKey;
use async_trait::async_trait;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    version: Version,
    record: PartitionRecord,
}

/// JSON-file partition-state store.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    fsync: bool,
}

impl FileStateStore {
    /// Open (and create) a store directory.
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(dir, true).await
    }

    /// Open a store directory, optionally skipping fsync on writes.
    pub async fn with_options(dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            IngestError::store(format!(
                "failed to create state directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir, fsync })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, key: &PartitionKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }

    fn lock_path(&self, key: &PartitionKey) -> PathBuf {
        self.dir.join(format!("{}.lock", key.as_str()))
    }

    fn decode_entry(path: &Path, contents: &str) -> Result<StoredEntry> {
        serde_json::from_str(contents).map_err(|e| {
            IngestError::serialization(format!(
                "corrupt partition state {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn read_entry(path: &Path) -> Result<Option<StoredEntry>> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IngestError::Io(e)),
        };
        Self::decode_entry(path, &contents).map(Some)
    }

    fn read_entry_blocking(path: &Path) -> Result<Option<StoredEntry>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IngestError::Io(e)),
        };
        Self::decode_entry(path, &contents).map(Some)
    }

    fn write_entry_blocking(path: &Path, entry: &StoredEntry, fsync: bool) -> Result<()> {
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(entry)?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&json)?;
        if fsync {
            file.sync_all()?;
        }
        drop(file);

        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Read, compare and replace under the key's exclusive file lock.
    fn compare_and_write(
        path: &Path,
        lock_path: &Path,
        record: PartitionRecord,
        expected: Option<Version>,
        fsync: bool,
    ) -> Result<WriteOutcome> {
        let lock = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;
        FileExt::lock_exclusive(&lock)?;

        let current = Self::read_entry_blocking(path)?.map(|e| e.version);
        if current != expected {
            return Ok(WriteOutcome::Conflict { current });
        }

        let version = current.map_or(Version::INITIAL, Version::next);
        Self::write_entry_blocking(path, &StoredEntry { version, record }, fsync)?;
        // dropping the handle releases the lock
        drop(lock);
        Ok(WriteOutcome::Written(version))
    }
}

#[async_trait]
impl PartitionStateStore for FileStateStore {
    async fn read(&self, key: &PartitionKey) -> Result<Option<Versioned<PartitionRecord>>> {
        validate_store_key(key)?;
        Ok(Self::read_entry(&self.file_path(key))
            .await?
            .map(|entry| Versioned {
                value: entry.record,
                version: entry.version,
            }))
    }

    async fn write_if_version(
        &self,
        key: &PartitionKey,
        record: &PartitionRecord,
        expected: Option<Version>,
    ) -> Result<WriteOutcome> {
        validate_store_key(key)?;
        let path = self.file_path(key);
        let lock_path = self.lock_path(key);
        let record = record.clone();
        let fsync = self.fsync;

        let outcome = tokio::task::spawn_blocking(move || {
            Self::compare_and_write(&path, &lock_path, record, expected, fsync)
        })
        .await
        .map_err(|e| IngestError::store(format!("state write task failed: {}", e)))??;

        if let WriteOutcome::Conflict { current } = outcome {
            debug!(partition = %key, ?current, ?expected, "Conditional write conflict");
        }
        Ok(outcome)
    }

    async fn list(&self) -> Result<Vec<Versioned<PartitionRecord>>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IngestError::Io(e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_state_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json") && !n.ends_with(".json.tmp"));
            if !is_state_file {
                continue;
            }
            if let Some(stored) = Self::read_entry(&path).await? {
                records.push(Versioned {
                    value: stored.record,
                    version: stored.version,
                });
            }
        }
        records.sort_by(|a, b| a.value.partition.cmp(&b.value.partition));
        Ok(records)
    }
}
