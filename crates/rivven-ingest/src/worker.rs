//! Worker lifecycle
//!
//! An [`IngestionWorker`] is one member of a group of interchangeable
//! workers sharing a state store. `start` registers the configured
//! partitions and spawns an acquisition loop that claims partitions up to
//! `acquisition.max_partitions`, running one [`PartitionTask`] each. `stop`
//! cancels everything and gives the partitions back so other workers can
//! claim them without waiting for lease expiry.

use crate::buffer::SharedBuffer;
use crate::clock::{SharedClock, SystemClock};
use crate::config::{AcquisitionConfig, SourceConfig};
use crate::coordinator::PartitionCoordinator;
use crate::error::{IngestError, Result};
use crate::resilience::ExponentialBackoff;
use crate::snapshot::SnapshotWorker;
use crate::source::{SharedChangeStreamSource, SharedSnapshotSource};
use crate::store::SharedStateStore;
use crate::stream::StreamWorker;
use crate::task::{PartitionContext, PartitionSettings, PartitionTask, TaskExit};
use crate::types::{OwnerId, PartitionKey};
use crate::validation::{CollectionSpec, CollectionValidator};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type OwnedPartitions = Arc<RwLock<BTreeSet<PartitionKey>>>;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    coordinator: PartitionCoordinator,
}

/// Lifecycle surface of one ingestion worker.
pub struct IngestionWorker {
    config: SourceConfig,
    specs: Vec<CollectionSpec>,
    store: SharedStateStore,
    snapshot_source: SharedSnapshotSource,
    stream_source: SharedChangeStreamSource,
    owner: OwnerId,
    clock: SharedClock,
    running: AtomicBool,
    state: Mutex<Option<Running>>,
    owned: OwnedPartitions,
}

impl IngestionWorker {
    /// Validate `config` and build a stopped worker.
    ///
    /// Configuration errors are fatal and returned before any store access.
    pub fn new(
        config: SourceConfig,
        store: SharedStateStore,
        snapshot_source: SharedSnapshotSource,
        stream_source: SharedChangeStreamSource,
    ) -> Result<Self> {
        config.validate_config()?;
        let specs = CollectionValidator::validate(&config)?;

        Ok(Self {
            config,
            specs,
            store,
            snapshot_source,
            stream_source,
            owner: OwnerId::generate(),
            clock: Arc::new(SystemClock),
            running: AtomicBool::new(false),
            state: Mutex::new(None),
            owned: Arc::new(RwLock::new(BTreeSet::new())),
        })
    }

    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Validated partitions this worker registers.
    pub fn specs(&self) -> &[CollectionSpec] {
        &self.specs
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Partitions with a running task on this worker.
    pub fn owned_partitions(&self) -> Vec<PartitionKey> {
        self.owned.read().iter().cloned().collect()
    }

    pub fn coordinator(&self) -> PartitionCoordinator {
        PartitionCoordinator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.lease.clone(),
        )
    }

    /// Register partitions and begin acquiring them.
    pub async fn start(&self, buffer: SharedBuffer) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IngestError::config(format!(
                "worker {} is already started",
                self.owner
            )));
        }

        let coordinator = self.coordinator();
        let created = match coordinator.register_partitions(&self.specs).await {
            Ok(created) => created,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(
            owner = %self.owner,
            partitions = self.specs.len(),
            created,
            max_partitions = self.config.acquisition.max_partitions,
            "Starting ingestion worker"
        );

        let ctx = Arc::new(PartitionContext {
            coordinator: coordinator.clone(),
            snapshot: SnapshotWorker::new(Arc::clone(&self.snapshot_source), &self.config.snapshot),
            stream: StreamWorker::new(Arc::clone(&self.stream_source), &self.config.stream),
            buffer,
            owner: self.owner.clone(),
            settings: PartitionSettings::from_config(&self.config),
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(acquisition_loop(
            ctx,
            self.config.acquisition.clone(),
            cancel.clone(),
            Arc::clone(&self.owned),
        ));

        *self.state.lock() = Some(Running {
            cancel,
            handle,
            coordinator,
        });
        Ok(())
    }

    /// Stop all partition tasks and give up their partitions. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.state.lock().take() else {
            return Ok(());
        };

        info!(owner = %self.owner, "Stopping ingestion worker");
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!(owner = %self.owner, error = %e, "Acquisition loop panicked");
        }

        let released = running.coordinator.give_up_all_partitions(&self.owner).await;
        self.owned.write().clear();
        self.running.store(false, Ordering::SeqCst);

        let released = released?;
        info!(owner = %self.owner, released, "Ingestion worker stopped");
        Ok(())
    }
}

impl Drop for IngestionWorker {
    fn drop(&mut self) {
        if let Some(running) = self.state.lock().take() {
            running.cancel.cancel();
        }
    }
}

async fn acquisition_loop(
    ctx: Arc<PartitionContext>,
    acquisition: AcquisitionConfig,
    cancel: CancellationToken,
    owned: OwnedPartitions,
) {
    let mut tasks: JoinSet<TaskExit> = JoinSet::new();
    let mut running: HashMap<tokio::task::Id, PartitionKey> = HashMap::new();
    let mut backoff = ExponentialBackoff::new(acquisition.interval(), acquisition.max_interval());
    let mut cooldown: Option<Duration> = None;

    loop {
        let wait = if let Some(pause) = cooldown.take() {
            pause
        } else if tasks.len() < acquisition.max_partitions {
            match ctx.coordinator.acquire_next_partition(&ctx.owner).await {
                Ok(acquired) => {
                    backoff.reset();
                    let partition = acquired.partition.clone();
                    owned.write().insert(partition.clone());
                    let task = PartitionTask::new(Arc::clone(&ctx), acquired, cancel.clone());
                    let handle = tasks.spawn(task.run());
                    running.insert(handle.id(), partition);
                    Duration::ZERO
                }
                Err(IngestError::NoAvailablePartition) => {
                    let delay = backoff.next_backoff();
                    debug!(owner = %ctx.owner, delay_ms = delay.as_millis() as u64, "No partition available");
                    delay
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!(owner = %ctx.owner, error = %e, delay_ms = delay.as_millis() as u64, "Partition acquisition failed");
                    delay
                }
            }
        } else {
            acquisition.max_interval()
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                if on_task_exit(joined, &mut running, &owned) {
                    cooldown = Some(backoff.next_backoff());
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!(owner = %ctx.owner, tasks = tasks.len(), "Waiting for partition tasks");
    while let Some(joined) = tasks.join_next_with_id().await {
        on_task_exit(joined, &mut running, &owned);
    }
}

/// Book-keeping for a finished task. Returns true if the task failed.
fn on_task_exit(
    joined: std::result::Result<(tokio::task::Id, TaskExit), tokio::task::JoinError>,
    running: &mut HashMap<tokio::task::Id, PartitionKey>,
    owned: &OwnedPartitions,
) -> bool {
    let (id, failed) = match joined {
        Ok((id, exit)) => (id, matches!(exit, TaskExit::Failed(_))),
        Err(e) => {
            error!(error = %e, "Partition task panicked");
            (e.id(), true)
        }
    };
    if let Some(partition) = running.remove(&id) {
        owned.write().remove(&partition);
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use crate::testing::{MockSource, RecordingBuffer};

    fn worker(collections: &[&str]) -> Result<IngestionWorker> {
        let source = Arc::new(MockSource::new());
        IngestionWorker::new(
            SourceConfig::new(collections.iter().copied()),
            Arc::new(MemoryStateStore::new()),
            source.clone(),
            source,
        )
    }

    #[test]
    fn test_invalid_collection_is_fatal() {
        let err = worker(&["orders"]).err().unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, IngestError::InvalidPartitionIdentifier { .. }));
    }

    #[test]
    fn test_generated_owner() {
        let worker = worker(&["shop.orders"]).unwrap();
        assert!(worker.owner().as_str().starts_with("worker-"));
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let worker = worker(&["shop.orders"]).unwrap();
        let buffer = Arc::new(RecordingBuffer::new());
        worker.start(buffer.clone()).await.unwrap();
        assert!(matches!(
            worker.start(buffer).await,
            Err(IngestError::Config(_))
        ));
        worker.stop().await.unwrap();
        worker.stop().await.unwrap();
        assert!(!worker.is_running());
    }
}
