//! Partition-state store
//!
//! The store is the only state shared between workers. Every mutation is a
//! conditional write against the version last read, so two workers racing
//! for the same partition cannot both win.
//!
//! | Store                | Scope                 | Use                    |
//! |----------------------|-----------------------|------------------------|
//! | [`MemoryStateStore`] | one process           | tests, embedded runs   |
//! | [`FileStateStore`]   | one host, JSON files  | single-node deployments|

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use crate::error::Result;
use crate::partition::PartitionRecord;
use crate::types::PartitionKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-key version, bumped on every successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored; the record now has this version
    Written(Version),
    /// Someone else wrote first; `current` is the version found
    Conflict { current: Option<Version> },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

/// Conditional-write key/value table of partition records.
#[async_trait]
pub trait PartitionStateStore: Send + Sync {
    /// Read a record and its current version.
    async fn read(&self, key: &PartitionKey) -> Result<Option<Versioned<PartitionRecord>>>;

    /// Write `record` under `key` if the stored version equals `expected`.
    ///
    /// `expected = None` means "create only if absent".
    async fn write_if_version(
        &self,
        key: &PartitionKey,
        record: &PartitionRecord,
        expected: Option<Version>,
    ) -> Result<WriteOutcome>;

    /// All records, in key order.
    async fn list(&self) -> Result<Vec<Versioned<PartitionRecord>>>;
}

/// Shared store handle
pub type SharedStateStore = Arc<dyn PartitionStateStore>;

/// Reject keys that cannot be used as a storage name.
pub(crate) fn validate_store_key(key: &PartitionKey) -> Result<()> {
    let key = key.as_str();
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
        return Err(crate::error::IngestError::store(format!(
            "invalid partition key for storage: '{}'",
            key
        )));
    }
    Ok(())
}
