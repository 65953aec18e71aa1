//! Partition lease coordination
//!
//! Workers never talk to each other. They claim, renew and release
//! partitions through conditional writes on the shared state store:
//!
//! ```text
//! read(key) -> record @ v7
//! write_if_version(key, record', Some(v7))
//!   Written(v8)   -> change applied
//!   Conflict      -> someone else wrote first; re-read (or move on)
//! ```
//!
//! Lease validity is judged against the coordinator's [`Clock`](crate::clock::Clock).
//! Checkpoint commits carry the lease extension in the same write, so
//! ownership and progress never diverge.

use crate::clock::{duration_millis, SharedClock};
use crate::config::LeaseConfig;
use crate::error::{IngestError, Result};
use crate::mode::{IngestionModeController, PartitionPhase};
use crate::partition::{AcquiredPartition, Lease, PartitionProgress, PartitionRecord};
use crate::store::{SharedStateStore, Versioned, WriteOutcome};
use crate::types::{OwnerId, PartitionKey};
use crate::validation::CollectionSpec;
use tracing::{debug, info, warn};

/// Claims, renews and releases partition leases.
#[derive(Clone)]
pub struct PartitionCoordinator {
    store: SharedStateStore,
    clock: SharedClock,
    lease: LeaseConfig,
}

impl PartitionCoordinator {
    pub fn new(store: SharedStateStore, clock: SharedClock, lease: LeaseConfig) -> Self {
        Self {
            store,
            clock,
            lease,
        }
    }

    pub fn lease_config(&self) -> &LeaseConfig {
        &self.lease
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Create a record for every collection not registered yet.
    ///
    /// Existing records keep their progress. Returns how many were created.
    pub async fn register_partitions(&self, specs: &[CollectionSpec]) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut created = 0;

        for spec in specs {
            let record = PartitionRecord::new(spec.partition.clone(), spec.mode, now);
            match self
                .store
                .write_if_version(&spec.partition, &record, None)
                .await?
            {
                WriteOutcome::Written(_) => {
                    created += 1;
                    info!(
                        partition = %spec.partition,
                        mode = %spec.mode.as_str(),
                        phase = %spec.initial_phase,
                        "Registered partition"
                    );
                }
                WriteOutcome::Conflict { .. } => {
                    if let Some(existing) = self.store.read(&spec.partition).await? {
                        if existing.value.mode != spec.mode {
                            warn!(
                                partition = %spec.partition,
                                stored = %existing.value.mode.as_str(),
                                configured = %spec.mode.as_str(),
                                "Partition already registered with a different mode, keeping stored mode"
                            );
                        }
                    }
                    debug!(partition = %spec.partition, "Partition already registered");
                }
            }
        }

        Ok(created)
    }

    /// Claim one unassigned or expired partition for `owner`.
    pub async fn acquire_next_partition(&self, owner: &OwnerId) -> Result<AcquiredPartition> {
        let now = self.clock.now_millis();
        let mut candidates: Vec<Versioned<PartitionRecord>> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|entry| entry.value.is_claimable(now))
            .collect();

        // unassigned first, then key order
        candidates.sort_by(|a, b| {
            a.value
                .lease
                .is_some()
                .cmp(&b.value.lease.is_some())
                .then_with(|| a.value.partition.cmp(&b.value.partition))
        });

        for Versioned {
            value: mut record,
            version,
        } in candidates
        {
            let previous = record.lease.take();
            record.lease_epoch += 1;
            let lease = Lease {
                owner: owner.clone(),
                epoch: record.lease_epoch,
                acquired_at_ms: now,
                expires_at_ms: now + self.lease_millis(),
            };
            record.lease = Some(lease.clone());
            record.updated_at_ms = now;

            match self
                .store
                .write_if_version(&record.partition, &record, Some(version))
                .await?
            {
                WriteOutcome::Written(_) => {
                    match previous {
                        Some(expired) => info!(
                            partition = %record.partition,
                            owner = %owner,
                            previous_owner = %expired.owner,
                            epoch = lease.epoch,
                            seq = record.progress.checkpoint_seq,
                            "Reclaimed partition with expired lease"
                        ),
                        None => info!(
                            partition = %record.partition,
                            owner = %owner,
                            epoch = lease.epoch,
                            seq = record.progress.checkpoint_seq,
                            "Claimed partition"
                        ),
                    }
                    return Ok(AcquiredPartition {
                        partition: record.partition,
                        mode: record.mode,
                        lease,
                        progress: record.progress,
                    });
                }
                WriteOutcome::Conflict { .. } => {
                    debug!(partition = %record.partition, owner = %owner, "Lost claim race, trying next candidate");
                }
            }
        }

        Err(IngestError::NoAvailablePartition)
    }

    /// Extend `owner`'s lease on `partition`.
    pub async fn renew_lease(&self, partition: &PartitionKey, owner: &OwnerId) -> Result<Lease> {
        let lease = self
            .update_leased(partition, owner, "renew lease", |_, _| Ok(()))
            .await?;
        debug!(partition = %partition, owner = %owner, expires_at_ms = lease.expires_at_ms, "Renewed lease");
        Ok(lease)
    }

    /// Persist `progress` and extend the lease in one conditional write.
    pub async fn commit_checkpoint(
        &self,
        partition: &PartitionKey,
        owner: &OwnerId,
        progress: &PartitionProgress,
    ) -> Result<Lease> {
        let lease = self
            .update_leased(partition, owner, "commit checkpoint", |record, _| {
                let committed = record.progress.checkpoint_seq;
                if progress.checkpoint_seq <= committed {
                    return Err(IngestError::StaleCheckpoint {
                        partition: record.partition.clone(),
                        committed,
                        attempted: progress.checkpoint_seq,
                    });
                }
                record.progress = progress.clone();
                Ok(())
            })
            .await?;
        debug!(
            partition = %partition,
            owner = %owner,
            seq = progress.checkpoint_seq,
            phase = %progress.phase,
            "Committed checkpoint"
        );
        Ok(lease)
    }

    /// Clear the lease if `owner` holds it. Progress is left untouched.
    ///
    /// Returns whether a lease was cleared.
    pub async fn release_partition(&self, partition: &PartitionKey, owner: &OwnerId) -> Result<bool> {
        for attempt in 0..=self.lease.max_conflict_retries {
            let Some(Versioned {
                value: mut record,
                version,
            }) = self.store.read(partition).await?
            else {
                return Ok(false);
            };
            if record.owner() != Some(owner) {
                debug!(partition = %partition, owner = %owner, "Not releasing partition held by another owner");
                return Ok(false);
            }

            record.lease = None;
            record.updated_at_ms = self.clock.now_millis();
            match self
                .store
                .write_if_version(partition, &record, Some(version))
                .await?
            {
                WriteOutcome::Written(_) => {
                    info!(
                        partition = %partition,
                        owner = %owner,
                        seq = record.progress.checkpoint_seq,
                        "Released partition"
                    );
                    return Ok(true);
                }
                WriteOutcome::Conflict { .. } => {
                    debug!(partition = %partition, attempt, "Release conflicted, re-reading");
                }
            }
        }

        Err(self.conflicts_exhausted("release partition", partition))
    }

    /// Release every partition the store lists as held by `owner`.
    pub async fn give_up_all_partitions(&self, owner: &OwnerId) -> Result<usize> {
        let held: Vec<PartitionKey> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|entry| entry.value.owner() == Some(owner))
            .map(|entry| entry.value.partition)
            .collect();

        let mut released = 0;
        for partition in &held {
            match self.release_partition(partition, owner).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(partition = %partition, owner = %owner, error = %e, "Failed to give up partition");
                }
            }
        }

        info!(owner = %owner, released, "Gave up partitions");
        Ok(released)
    }

    /// Retire a partition: mark it `Done` and revoke any lease.
    ///
    /// A current holder finds out on its next renew or commit and stops.
    pub async fn decommission_partition(&self, partition: &PartitionKey) -> Result<PartitionRecord> {
        for attempt in 0..=self.lease.max_conflict_retries {
            let Versioned {
                value: mut record,
                version,
            } = self
                .store
                .read(partition)
                .await?
                .ok_or_else(|| IngestError::PartitionNotFound(partition.clone()))?;

            let mut controller = IngestionModeController::new(
                partition.clone(),
                record.mode,
                record.progress.phase.clone(),
            );
            controller.decommission()?;

            let holder = record.owner().cloned();
            record.progress.phase = PartitionPhase::Done;
            record.progress.checkpoint_seq += 1;
            record.lease = None;
            record.updated_at_ms = self.clock.now_millis();
            match self
                .store
                .write_if_version(partition, &record, Some(version))
                .await?
            {
                WriteOutcome::Written(_) => {
                    info!(
                        partition = %partition,
                        revoked = ?holder.as_ref().map(|o| o.as_str().to_string()),
                        seq = record.progress.checkpoint_seq,
                        "Decommissioned partition"
                    );
                    return Ok(record);
                }
                WriteOutcome::Conflict { .. } => {
                    debug!(partition = %partition, attempt, "Decommission conflicted, re-reading");
                }
            }
        }

        Err(self.conflicts_exhausted("decommission partition", partition))
    }

    /// Every registered partition, in key order.
    pub async fn partitions(&self) -> Result<Vec<PartitionRecord>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|entry| entry.value)
            .collect())
    }

    pub async fn partition(&self, partition: &PartitionKey) -> Result<Option<PartitionRecord>> {
        Ok(self.store.read(partition).await?.map(|entry| entry.value))
    }

    fn lease_millis(&self) -> i64 {
        duration_millis(self.lease.duration())
    }

    fn conflicts_exhausted(&self, op: &str, partition: &PartitionKey) -> IngestError {
        IngestError::store(format!(
            "{} for '{}' conflicted {} times",
            op,
            partition,
            self.lease.max_conflict_retries + 1
        ))
    }

    /// Read-check-write loop for mutations that require a valid lease.
    ///
    /// The lease is extended on every successful write.
    async fn update_leased<F>(
        &self,
        partition: &PartitionKey,
        owner: &OwnerId,
        op: &'static str,
        mut apply: F,
    ) -> Result<Lease>
    where
        F: FnMut(&mut PartitionRecord, i64) -> Result<()> + Send,
    {
        for attempt in 0..=self.lease.max_conflict_retries {
            let Versioned {
                value: mut record,
                version,
            } = self
                .store
                .read(partition)
                .await?
                .ok_or_else(|| IngestError::PartitionNotFound(partition.clone()))?;

            let now = self.clock.now_millis();
            let lease = match record.lease.as_mut() {
                Some(lease) if lease.is_held_by(owner, now) => {
                    lease.expires_at_ms = now + self.lease_millis();
                    lease.clone()
                }
                current => {
                    warn!(
                        partition = %partition,
                        owner = %owner,
                        holder = ?current.map(|l| l.owner.as_str().to_string()),
                        op,
                        "Lease lost"
                    );
                    return Err(IngestError::lease_lost(partition));
                }
            };

            apply(&mut record, now)?;
            record.updated_at_ms = now;

            match self
                .store
                .write_if_version(partition, &record, Some(version))
                .await?
            {
                WriteOutcome::Written(_) => return Ok(lease),
                WriteOutcome::Conflict { current } => {
                    debug!(
                        partition = %partition,
                        op,
                        attempt,
                        current = ?current,
                        "Conditional write conflicted, re-reading"
                    );
                }
            }
        }

        Err(self.conflicts_exhausted(op, partition))
    }
}
