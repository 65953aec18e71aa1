//! Partition records as persisted in the state store

use crate::mode::{IngestionModeController, PartitionPhase};
use crate::types::{IngestionMode, OwnerId, PartitionKey};
use serde::{Deserialize, Serialize};

/// Time-bounded ownership of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: OwnerId,
    /// Incremented on every successful claim of the partition
    pub epoch: u64,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

impl Lease {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Held by `owner` and still valid at `now_ms`.
    pub fn is_held_by(&self, owner: &OwnerId, now_ms: i64) -> bool {
        &self.owner == owner && !self.is_expired_at(now_ms)
    }

    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        (self.expires_at_ms - now_ms).max(0)
    }
}

/// Committed progress of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProgress {
    pub phase: PartitionPhase,
    /// Strictly increasing across commits
    pub checkpoint_seq: u64,
    #[serde(default)]
    pub records_exported: u64,
    #[serde(default)]
    pub records_streamed: u64,
    #[serde(default)]
    pub records_skipped: u64,
    #[serde(default)]
    pub resyncs: u32,
}

impl PartitionProgress {
    pub fn new(phase: PartitionPhase) -> Self {
        Self {
            phase,
            checkpoint_seq: 0,
            records_exported: 0,
            records_streamed: 0,
            records_skipped: 0,
            resyncs: 0,
        }
    }
}

/// One row of the partition-state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub partition: PartitionKey,
    pub mode: IngestionMode,
    pub lease: Option<Lease>,
    #[serde(default)]
    pub lease_epoch: u64,
    pub progress: PartitionProgress,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl PartitionRecord {
    pub fn new(partition: PartitionKey, mode: IngestionMode, now_ms: i64) -> Self {
        Self {
            partition,
            mode,
            lease: None,
            lease_epoch: 0,
            progress: PartitionProgress::new(IngestionModeController::initial_phase(mode)),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Not finished and either unassigned or with an expired lease.
    pub fn is_claimable(&self, now_ms: i64) -> bool {
        !self.progress.phase.is_terminal()
            && self
                .lease
                .as_ref()
                .map_or(true, |lease| lease.is_expired_at(now_ms))
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        self.lease.as_ref().map(|lease| &lease.owner)
    }
}

/// A partition handed to a worker by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredPartition {
    pub partition: PartitionKey,
    pub mode: IngestionMode,
    pub lease: Lease,
    /// Last committed progress
    pub progress: PartitionProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(owner: &str, expires_at_ms: i64) -> Lease {
        Lease {
            owner: OwnerId::new(owner),
            epoch: 1,
            acquired_at_ms: 0,
            expires_at_ms,
        }
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let l = lease("a", 30_000);
        assert!(!l.is_expired_at(29_999));
        assert!(l.is_expired_at(30_000));
        assert!(l.is_held_by(&OwnerId::new("a"), 10));
        assert!(!l.is_held_by(&OwnerId::new("b"), 10));
        assert_eq!(l.remaining_ms(31_000), 0);
    }

    #[test]
    fn test_record_claimable() {
        let mut record = PartitionRecord::new(
            PartitionKey::new("shop.orders"),
            IngestionMode::ExportThenStream,
            0,
        );
        assert_eq!(record.progress.phase, PartitionPhase::PendingExport);
        assert!(record.is_claimable(0));

        record.lease = Some(lease("a", 30_000));
        assert!(!record.is_claimable(1_000));
        assert!(record.is_claimable(31_000));
        assert_eq!(record.owner(), Some(&OwnerId::new("a")));

        record.lease = None;
        record.progress.phase = PartitionPhase::Done;
        assert!(!record.is_claimable(0));
    }

    #[test]
    fn test_record_json_shape() {
        let record = PartitionRecord::new(
            PartitionKey::new("shop.audit"),
            IngestionMode::Stream,
            7,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["partition"], "shop.audit");
        assert_eq!(json["mode"], "stream");
        assert_eq!(json["progress"]["phase"]["state"], "stream_only");
        assert!(json["lease"].is_null());
    }
}
