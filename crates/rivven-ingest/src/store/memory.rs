//! In-memory partition-state store

use super::{validate_store_key, PartitionStateStore, Version, Versioned, WriteOutcome};
use crate::error::{IngestError, Result};
use crate::partition::PartitionRecord;
use crate::types::PartitionKey;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// In-memory store for tests and single-process runs.
///
/// Conflicts and failures can be injected to exercise the retry paths of the
/// coordinator.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<PartitionKey, Versioned<PartitionRecord>>>,
    injected_conflicts: AtomicU32,
    injected_failures: AtomicU32,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` conditional writes report a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` operations fail with a store error.
    pub fn inject_failures(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_failure(&self) -> Result<()> {
        if Self::take_injected(&self.injected_failures) {
            return Err(IngestError::store("injected store failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PartitionStateStore for MemoryStateStore {
    async fn read(&self, key: &PartitionKey) -> Result<Option<Versioned<PartitionRecord>>> {
        self.check_failure()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn write_if_version(
        &self,
        key: &PartitionKey,
        record: &PartitionRecord,
        expected: Option<Version>,
    ) -> Result<WriteOutcome> {
        validate_store_key(key)?;
        self.check_failure()?;

        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|e| e.version);

        if Self::take_injected(&self.injected_conflicts) || current != expected {
            return Ok(WriteOutcome::Conflict { current });
        }

        let version = current.map_or(Version::INITIAL, Version::next);
        entries.insert(
            key.clone(),
            Versioned {
                value: record.clone(),
                version,
            },
        );
        Ok(WriteOutcome::Written(version))
    }

    async fn list(&self) -> Result<Vec<Versioned<PartitionRecord>>> {
        self.check_failure()?;
        Ok(self.entries.lock().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IngestionMode;

    fn record(key: &str) -> PartitionRecord {
        PartitionRecord::new(PartitionKey::new(key), IngestionMode::Export, 0)
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = MemoryStateStore::new();
        let key = PartitionKey::new("shop.orders");

        let first = store
            .write_if_version(&key, &record("shop.orders"), None)
            .await
            .unwrap();
        assert_eq!(first, WriteOutcome::Written(Version(1)));

        let second = store
            .write_if_version(&key, &record("shop.orders"), None)
            .await
            .unwrap();
        assert_eq!(
            second,
            WriteOutcome::Conflict {
                current: Some(Version(1))
            }
        );
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStateStore::new();
        let key = PartitionKey::new("shop.orders");
        store
            .write_if_version(&key, &record("shop.orders"), None)
            .await
            .unwrap();

        let current = store.read(&key).await.unwrap().unwrap();
        let mut updated = current.value.clone();
        updated.updated_at_ms = 99;

        let outcome = store
            .write_if_version(&key, &updated, Some(current.version))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written(Version(2)));

        // stale version loses
        let outcome = store
            .write_if_version(&key, &updated, Some(current.version))
            .await
            .unwrap();
        assert!(!outcome.is_written());

        let read = store.read(&key).await.unwrap().unwrap();
        assert_eq!(read.version, Version(2));
        assert_eq!(read.value.updated_at_ms, 99);
    }

    #[tokio::test]
    async fn test_injected_conflict_and_failure() {
        let store = MemoryStateStore::new();
        let key = PartitionKey::new("shop.orders");

        store.inject_conflicts(1);
        let outcome = store
            .write_if_version(&key, &record("shop.orders"), None)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict { current: None });

        store.inject_failures(1);
        assert!(store.list().await.is_err());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let store = MemoryStateStore::new();
        for key in ["shop.b", "shop.a", "crm.z"] {
            store
                .write_if_version(&PartitionKey::new(key), &record(key), None)
                .await
                .unwrap();
        }
        let keys: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.value.partition.to_string())
            .collect();
        assert_eq!(keys, vec!["crm.z", "shop.a", "shop.b"]);
        assert_eq!(store.len(), 3);
    }
}
