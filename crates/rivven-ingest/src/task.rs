//! Per-partition ingestion task
//!
//! A [`PartitionTask`] runs one leased partition until it is done, fails,
//! loses its lease or the worker stops:
//!
//! ```text
//! PendingExport --capture watermark--> Exporting --pages--> (marker) PendingStream
//!                                                                   |
//!             resync (history lost) <-- Streaming <--begin stream---+
//! ```
//!
//! Every batch handed to the buffer is tracked by the partition's
//! [`AcknowledgementGate`]; checkpoints are committed only for acknowledged
//! prefixes. A lease renewal task runs beside the main loop and cancels the
//! partition's work as soon as the lease is lost.

use crate::ack::{AcknowledgementGate, GateDecision};
use crate::buffer::SharedBuffer;
use crate::config::SourceConfig;
use crate::coordinator::PartitionCoordinator;
use crate::error::{IngestError, Result};
use crate::mode::{IngestionModeController, PartitionPhase};
use crate::partition::{AcquiredPartition, PartitionProgress};
use crate::record::{RecordBatch, SourceRecord};
use crate::snapshot::{SnapshotEvent, SnapshotWorker};
use crate::stream::StreamWorker;
use crate::types::{OwnerId, PartitionKey, ResumeToken, SnapshotCursor};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing and flow-control knobs for partition tasks.
#[derive(Debug, Clone)]
pub struct PartitionSettings {
    pub acknowledgments: bool,
    pub ack_timeout: Duration,
    pub ack_check_interval: Duration,
    pub max_in_flight: usize,
    pub renew_interval: Duration,
}

impl PartitionSettings {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            acknowledgments: config.acknowledgments,
            ack_timeout: config.ack.timeout(),
            ack_check_interval: config.ack.check_interval(),
            max_in_flight: config.ack.max_in_flight_batches.max(1),
            renew_interval: config.lease.renew_interval(),
        }
    }
}

/// Everything a worker's partition tasks share.
pub struct PartitionContext {
    pub coordinator: PartitionCoordinator,
    pub snapshot: SnapshotWorker,
    pub stream: StreamWorker,
    pub buffer: SharedBuffer,
    pub owner: OwnerId,
    pub settings: PartitionSettings,
}

/// How a partition task ended.
#[derive(Debug)]
pub enum TaskExit {
    /// Partition reached `Done` and was released
    Completed,
    /// Worker is stopping; the partition is given up by the worker
    Stopped,
    /// Another worker may own the partition now; the store was not touched
    LeaseLost,
    /// Partition-scoped failure; the partition was released for reassignment
    Failed(IngestError),
}

/// Whether a run loop must restart from the committed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Restart,
}

/// Runs one leased partition.
pub struct PartitionTask {
    ctx: Arc<PartitionContext>,
    partition: PartitionKey,
    controller: IngestionModeController,
    committed: PartitionProgress,
    cancel: CancellationToken,
}

impl PartitionTask {
    /// `cancel` is the worker's stop token.
    pub fn new(
        ctx: Arc<PartitionContext>,
        acquired: AcquiredPartition,
        cancel: CancellationToken,
    ) -> Self {
        let controller = IngestionModeController::new(
            acquired.partition.clone(),
            acquired.mode,
            acquired.progress.phase.clone(),
        );
        Self {
            ctx,
            partition: acquired.partition,
            controller,
            committed: acquired.progress,
            cancel,
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub async fn run(mut self) -> TaskExit {
        info!(
            partition = %self.partition,
            owner = %self.ctx.owner,
            phase = %self.controller.phase(),
            seq = self.committed.checkpoint_seq,
            "Starting partition task"
        );

        let work = self.cancel.child_token();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let renewal = tokio::spawn(renew_lease_loop(
            Arc::clone(&self.ctx),
            self.partition.clone(),
            work.clone(),
            Arc::clone(&lease_lost),
        ));

        let result = self.drive(&work).await;
        work.cancel();
        if let Err(e) = renewal.await {
            warn!(partition = %self.partition, error = %e, "Lease renewal task panicked");
        }

        let exit = if lease_lost.load(Ordering::SeqCst) {
            TaskExit::LeaseLost
        } else {
            match result {
                Ok(()) => TaskExit::Completed,
                Err(IngestError::Shutdown) => TaskExit::Stopped,
                Err(IngestError::LeaseLost { .. }) => TaskExit::LeaseLost,
                Err(e) => TaskExit::Failed(e),
            }
        };

        match &exit {
            TaskExit::Completed => {
                info!(
                    partition = %self.partition,
                    exported = self.committed.records_exported,
                    streamed = self.committed.records_streamed,
                    "Partition finished"
                );
                self.release().await;
            }
            TaskExit::Stopped => {
                info!(partition = %self.partition, seq = self.committed.checkpoint_seq, "Partition task stopped");
            }
            TaskExit::LeaseLost => {
                warn!(
                    partition = %self.partition,
                    owner = %self.ctx.owner,
                    seq = self.committed.checkpoint_seq,
                    "Lease lost, stopped emitting and checkpointing"
                );
            }
            TaskExit::Failed(e) => {
                warn!(
                    partition = %self.partition,
                    error = %e,
                    code = e.error_code(),
                    seq = self.committed.checkpoint_seq,
                    "Partition failed, releasing for reassignment"
                );
                self.release().await;
            }
        }

        exit
    }

    async fn release(&self) {
        if let Err(e) = self
            .ctx
            .coordinator
            .release_partition(&self.partition, &self.ctx.owner)
            .await
        {
            warn!(partition = %self.partition, error = %e, "Failed to release partition, lease will expire");
        }
    }

    async fn drive(&mut self, work: &CancellationToken) -> Result<()> {
        loop {
            if work.is_cancelled() {
                return Err(IngestError::Shutdown);
            }

            match self.controller.phase().clone() {
                PartitionPhase::PendingExport => {
                    let watermark = if self.controller.needs_watermark() {
                        let capture = self.ctx.snapshot.capture_watermark(&self.partition);
                        tokio::select! {
                            _ = work.cancelled() => return Err(IngestError::Shutdown),
                            token = capture => Some(token?),
                        }
                    } else {
                        None
                    };
                    self.controller.begin_export(watermark)?;
                    self.commit_phase(0).await?;
                }
                PartitionPhase::Exporting { cursor, .. } => {
                    self.run_export(work, cursor).await?;
                }
                PartitionPhase::PendingStream { .. } => {
                    self.controller.begin_stream()?;
                    self.commit_phase(0).await?;
                }
                PartitionPhase::Streaming { token: None }
                | PartitionPhase::StreamOnly { token: None } => {
                    // pin the start position so redelivery and takeover resume from it
                    let capture = self.ctx.snapshot.capture_watermark(&self.partition);
                    let start = tokio::select! {
                        _ = work.cancelled() => return Err(IngestError::Shutdown),
                        token = capture => token?,
                    };
                    self.controller.record_stream_progress(start)?;
                    self.commit_phase(0).await?;
                }
                PartitionPhase::Streaming { token } | PartitionPhase::StreamOnly { token } => {
                    match self.run_stream(work, token).await {
                        Err(IngestError::StreamResumeImpossible { reason, .. }) => {
                            self.resync(&reason).await?;
                        }
                        other => other?,
                    }
                }
                PartitionPhase::Done => return Ok(()),
            }
        }
    }

    /// Commit a transition taken with nothing in flight.
    async fn commit_phase(&mut self, extra_resyncs: u32) -> Result<()> {
        let mut progress = self.next_candidate(&self.committed, 0, 0, 0);
        progress.resyncs += extra_resyncs;
        self.ctx
            .coordinator
            .commit_checkpoint(&self.partition, &self.ctx.owner, &progress)
            .await?;
        info!(
            partition = %self.partition,
            phase = %progress.phase,
            seq = progress.checkpoint_seq,
            "Partition phase changed"
        );
        self.committed = progress;
        Ok(())
    }

    async fn resync(&mut self, reason: &str) -> Result<()> {
        warn!(
            partition = %self.partition,
            reason = %reason,
            resyncs = self.committed.resyncs + 1,
            "Change stream cannot resume, re-exporting partition"
        );
        self.reset_to_committed();
        self.controller.resync()?;
        self.commit_phase(1).await
    }

    fn reset_to_committed(&mut self) {
        self.controller = IngestionModeController::new(
            self.partition.clone(),
            self.controller.mode(),
            self.committed.phase.clone(),
        );
    }

    /// Progress one checkpoint past `frontier` at the controller's phase.
    fn next_candidate(
        &self,
        frontier: &PartitionProgress,
        exported: u64,
        streamed: u64,
        skipped: u64,
    ) -> PartitionProgress {
        PartitionProgress {
            phase: self.controller.phase().clone(),
            checkpoint_seq: frontier.checkpoint_seq + 1,
            records_exported: frontier.records_exported + exported,
            records_streamed: frontier.records_streamed + streamed,
            records_skipped: frontier.records_skipped + skipped,
            resyncs: frontier.resyncs,
        }
    }

    fn new_gate(&self) -> (AcknowledgementGate, crate::ack::AckReceiver) {
        AcknowledgementGate::new(
            self.partition.clone(),
            self.committed.clone(),
            self.ctx.settings.ack_timeout,
        )
    }

    fn ack_ticker(&self) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval(self.ctx.settings.ack_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn run_export(
        &mut self,
        work: &CancellationToken,
        cursor: Option<SnapshotCursor>,
    ) -> Result<()> {
        let (mut gate, mut acks) = self.new_gate();
        let mut ticker = self.ack_ticker();
        let mut pages = self.ctx.snapshot.run(self.partition.clone(), cursor);
        let mut frontier = self.committed.clone();
        let mut exhausted = false;

        loop {
            if exhausted && gate.is_drained() {
                return Ok(());
            }
            let can_pull = !exhausted && gate.in_flight() < self.ctx.settings.max_in_flight;

            let decision = tokio::select! {
                biased;
                _ = work.cancelled() => {
                    gate.abandon();
                    return Err(IngestError::Shutdown);
                }
                Some(event) = acks.recv() => gate.apply(event),
                _ = ticker.tick() => gate.expire(Instant::now()),
                next = pages.next(), if can_pull => match next {
                    Some(Ok(SnapshotEvent::Batch(chunk))) => {
                        if let Some(cursor) = chunk.cursor {
                            self.controller.record_export_progress(cursor)?;
                        }
                        frontier = self.next_candidate(
                            &frontier,
                            chunk.records.len() as u64,
                            0,
                            chunk.skipped,
                        );
                        self.emit(work, &mut gate, &frontier, chunk.records).await?
                    }
                    Some(Ok(SnapshotEvent::Exhausted)) | None => {
                        exhausted = true;
                        self.controller.complete_export()?;
                        frontier = self.next_candidate(&frontier, 0, 0, 0);
                        debug!(
                            partition = %self.partition,
                            seq = frontier.checkpoint_seq,
                            next = %frontier.phase,
                            "Export exhausted, queueing phase marker"
                        );
                        let marker = gate.track(frontier.clone(), Vec::new())?;
                        gate.on_positive_ack(marker.token())
                    }
                    Some(Err(e)) => {
                        gate.abandon();
                        return Err(e);
                    }
                },
            };

            if self.apply_decision(decision).await? == Flow::Restart {
                return Ok(());
            }
        }
    }

    async fn run_stream(
        &mut self,
        work: &CancellationToken,
        token: Option<ResumeToken>,
    ) -> Result<()> {
        let (mut gate, mut acks) = self.new_gate();
        let mut ticker = self.ack_ticker();
        let mut changes = self.ctx.stream.run(self.partition.clone(), token);
        let mut frontier = self.committed.clone();

        loop {
            let can_pull = gate.in_flight() < self.ctx.settings.max_in_flight;

            let decision = tokio::select! {
                biased;
                _ = work.cancelled() => {
                    gate.abandon();
                    return Err(IngestError::Shutdown);
                }
                Some(event) = acks.recv() => gate.apply(event),
                _ = ticker.tick() => gate.expire(Instant::now()),
                next = changes.next(), if can_pull => match next {
                    Some(Ok(chunk)) => {
                        self.controller.record_stream_progress(chunk.token)?;
                        frontier = self.next_candidate(
                            &frontier,
                            0,
                            chunk.records.len() as u64,
                            chunk.skipped,
                        );
                        self.emit(work, &mut gate, &frontier, chunk.records).await?
                    }
                    Some(Err(e)) => {
                        gate.abandon();
                        return Err(e);
                    }
                    None => {
                        gate.abandon();
                        return Err(IngestError::source("change stream closed"));
                    }
                },
            };

            if self.apply_decision(decision).await? == Flow::Restart {
                return Ok(());
            }
        }
    }

    /// Track and enqueue one batch.
    async fn emit(
        &self,
        work: &CancellationToken,
        gate: &mut AcknowledgementGate,
        candidate: &PartitionProgress,
        records: Vec<SourceRecord>,
    ) -> Result<GateDecision> {
        let record_ids = records.iter().map(|r| r.id.clone()).collect();
        let handle = gate.track(candidate.clone(), record_ids)?;

        if records.is_empty() {
            return Ok(gate.on_positive_ack(handle.token()));
        }

        let count = records.len();
        let batch = RecordBatch::new(
            self.partition.clone(),
            candidate.checkpoint_seq,
            records,
            self.ctx.settings.acknowledgments.then(|| handle.clone()),
        );

        tokio::select! {
            biased;
            _ = work.cancelled() => {
                gate.abandon();
                return Err(IngestError::Shutdown);
            }
            enqueued = self.ctx.buffer.enqueue(batch) => enqueued?,
        }
        debug!(
            partition = %self.partition,
            seq = candidate.checkpoint_seq,
            records = count,
            in_flight = gate.in_flight(),
            "Enqueued batch"
        );

        if self.ctx.settings.acknowledgments {
            Ok(GateDecision::Pending)
        } else {
            Ok(gate.on_positive_ack(handle.token()))
        }
    }

    async fn apply_decision(&mut self, decision: GateDecision) -> Result<Flow> {
        match decision {
            GateDecision::Pending => Ok(Flow::Continue),
            GateDecision::Commit(progress) => {
                self.ctx
                    .coordinator
                    .commit_checkpoint(&self.partition, &self.ctx.owner, &progress)
                    .await?;
                if progress.phase.name() != self.committed.phase.name() {
                    info!(
                        partition = %self.partition,
                        phase = %progress.phase,
                        seq = progress.checkpoint_seq,
                        "Partition phase changed"
                    );
                }
                self.committed = progress;
                Ok(Flow::Continue)
            }
            GateDecision::Redeliver { from } => {
                info!(
                    partition = %self.partition,
                    seq = from.checkpoint_seq,
                    phase = %from.phase,
                    "Redelivering from last checkpoint"
                );
                self.reset_to_committed();
                Ok(Flow::Restart)
            }
        }
    }
}

/// Renew the lease until `work` is cancelled; cancel it on lease loss.
async fn renew_lease_loop(
    ctx: Arc<PartitionContext>,
    partition: PartitionKey,
    work: CancellationToken,
    lease_lost: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(ctx.settings.renew_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = work.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match ctx.coordinator.renew_lease(&partition, &ctx.owner).await {
            Ok(_) => {}
            Err(e @ (IngestError::LeaseLost { .. } | IngestError::PartitionNotFound(_))) => {
                warn!(partition = %partition, error = %e, "Lease renewal failed, stopping partition");
                lease_lost.store(true, Ordering::SeqCst);
                work.cancel();
                return;
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "Lease renewal failed, retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock, SystemClock};
    use crate::config::{LeaseConfig, SnapshotSettings, StreamSettings};
    use crate::record::ChangeOp;
    use crate::store::MemoryStateStore;
    use crate::testing::{MockSource, RecordingBuffer};
    use crate::types::IngestionMode;
    use crate::validation::CollectionSpec;

    struct Fixture {
        ctx: Arc<PartitionContext>,
        source: Arc<MockSource>,
        buffer: Arc<RecordingBuffer>,
    }

    fn settings(acknowledgments: bool) -> PartitionSettings {
        PartitionSettings {
            acknowledgments,
            ack_timeout: Duration::from_secs(30),
            ack_check_interval: Duration::from_millis(50),
            max_in_flight: 4,
            renew_interval: Duration::from_millis(50),
        }
    }

    fn fixture(
        source: MockSource,
        buffer: RecordingBuffer,
        clock: SharedClock,
        settings: PartitionSettings,
    ) -> Fixture {
        let source = Arc::new(source);
        let buffer = Arc::new(buffer);
        let snapshot_settings = SnapshotSettings {
            batch_size: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..Default::default()
        };
        let stream_settings = StreamSettings {
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..Default::default()
        };
        let ctx = Arc::new(PartitionContext {
            coordinator: PartitionCoordinator::new(
                Arc::new(MemoryStateStore::new()),
                clock,
                LeaseConfig::with_duration(Duration::from_secs(30)),
            ),
            snapshot: SnapshotWorker::new(source.clone(), &snapshot_settings),
            stream: StreamWorker::new(source.clone(), &stream_settings),
            buffer: buffer.clone(),
            owner: OwnerId::new("worker-a"),
            settings,
        });
        Fixture {
            ctx,
            source,
            buffer,
        }
    }

    async fn acquire(fx: &Fixture, key: &str, mode: IngestionMode) -> AcquiredPartition {
        fx.ctx
            .coordinator
            .register_partitions(&[CollectionSpec {
                partition: PartitionKey::new(key),
                mode,
                initial_phase: IngestionModeController::initial_phase(mode),
            }])
            .await
            .unwrap();
        fx.ctx
            .coordinator
            .acquire_next_partition(&fx.ctx.owner)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_export_completes_and_releases() {
        let fx = fixture(
            MockSource::new().with_documents("shop.orders", 5),
            RecordingBuffer::new(),
            Arc::new(SystemClock),
            settings(true),
        );
        let acquired = acquire(&fx, "shop.orders", IngestionMode::Export).await;

        let exit = PartitionTask::new(fx.ctx.clone(), acquired, CancellationToken::new())
            .run()
            .await;
        assert!(matches!(exit, TaskExit::Completed));
        assert_eq!(fx.buffer.records().len(), 5);

        let record = fx
            .ctx
            .coordinator
            .partition(&PartitionKey::new("shop.orders"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.progress.phase, PartitionPhase::Done);
        assert_eq!(record.progress.records_exported, 5);
        assert!(record.lease.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_acknowledgement() {
        let fx = fixture(
            MockSource::new().with_documents("shop.orders", 4),
            RecordingBuffer::manual(),
            Arc::new(SystemClock),
            settings(true),
        );
        let acquired = acquire(&fx, "shop.orders", IngestionMode::Export).await;
        let handle = tokio::spawn(
            PartitionTask::new(fx.ctx.clone(), acquired, CancellationToken::new()).run(),
        );

        fx.buffer.wait_for_batches(2).await;
        let key = PartitionKey::new("shop.orders");
        let before = fx.ctx.coordinator.partition(&key).await.unwrap().unwrap();
        assert!(matches!(before.progress.phase, PartitionPhase::Exporting { .. }));
        assert_eq!(before.progress.records_exported, 0);

        let batches = fx.buffer.batches();
        batches[1].acknowledge();
        batches[0].acknowledge();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, TaskExit::Completed));
        let after = fx.ctx.coordinator.partition(&key).await.unwrap().unwrap();
        assert_eq!(after.progress.phase, PartitionPhase::Done);
        assert_eq!(after.progress.records_exported, 4);
    }

    #[tokio::test]
    async fn test_negative_ack_redelivers_batch() {
        let buffer = RecordingBuffer::new();
        buffer.reject_next(1);
        let fx = fixture(
            MockSource::new().with_documents("shop.orders", 2),
            buffer,
            Arc::new(SystemClock),
            settings(true),
        );
        let acquired = acquire(&fx, "shop.orders", IngestionMode::Export).await;

        let exit = PartitionTask::new(fx.ctx.clone(), acquired, CancellationToken::new())
            .run()
            .await;
        assert!(matches!(exit, TaskExit::Completed));
        assert_eq!(
            fx.buffer.record_ids(),
            vec!["shop.orders-0", "shop.orders-1", "shop.orders-0", "shop.orders-1"]
        );
    }

    #[tokio::test]
    async fn test_rejected_first_stream_batch_is_redelivered() {
        let buffer = RecordingBuffer::new();
        buffer.reject_next(1);
        let fx = fixture(MockSource::new(), buffer, Arc::new(SystemClock), settings(true));
        let key = PartitionKey::new("shop.audit");
        let acquired = acquire(&fx, "shop.audit", IngestionMode::Stream).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(PartitionTask::new(fx.ctx.clone(), acquired, cancel.clone()).run());

        while fx.source.opened_with().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let pinned = fx.ctx.coordinator.partition(&key).await.unwrap().unwrap();
        assert_eq!(
            pinned.progress.phase,
            PartitionPhase::StreamOnly {
                token: Some(ResumeToken::new("00000000"))
            }
        );

        fx.source.push_change("shop.audit", "a", ChangeOp::Insert);
        tokio::time::timeout(Duration::from_secs(5), fx.buffer.wait_for_batches(2))
            .await
            .unwrap();
        assert_eq!(fx.buffer.record_ids(), vec!["a", "a"]);
        assert!(fx.source.opened_with().len() >= 2);
        assert!(fx
            .source
            .opened_with()
            .iter()
            .all(|(_, token)| token == &Some(ResumeToken::new("00000000"))));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let record = fx.ctx.coordinator.partition(&key).await.unwrap().unwrap();
            if record.progress.records_streamed == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "redelivered batch never committed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        assert!(matches!(handle.await.unwrap(), TaskExit::Stopped));
    }

    #[tokio::test]
    async fn test_stop_exits_without_release() {
        let fx = fixture(
            MockSource::new(),
            RecordingBuffer::new(),
            Arc::new(SystemClock),
            settings(true),
        );
        let acquired = acquire(&fx, "shop.audit", IngestionMode::Stream).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(PartitionTask::new(fx.ctx.clone(), acquired, cancel.clone()).run());

        // stream-only partitions open at the pinned head position
        while fx.source.opened_with().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fx.source.push_change("shop.audit", "a", ChangeOp::Insert);
        fx.buffer.wait_for_batches(1).await;
        cancel.cancel();

        let exit = handle.await.unwrap();
        assert!(matches!(exit, TaskExit::Stopped));
        let record = fx
            .ctx
            .coordinator
            .partition(&PartitionKey::new("shop.audit"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.owner(), Some(&fx.ctx.owner));
    }

    #[tokio::test]
    async fn test_history_loss_resyncs_partition() {
        let fx = fixture(
            MockSource::new().with_documents("shop.orders", 1),
            RecordingBuffer::new(),
            Arc::new(SystemClock),
            settings(true),
        );
        let key = PartitionKey::new("shop.orders");
        let acquired = acquire(&fx, "shop.orders", IngestionMode::Stream).await;

        // resume token from history that no longer exists
        let owner = fx.ctx.owner.clone();
        let mut progress = acquired.progress.clone();
        progress.phase = PartitionPhase::StreamOnly {
            token: Some(ResumeToken::new("00000001")),
        };
        progress.checkpoint_seq = 1;
        fx.source.push_change("shop.orders", "old", ChangeOp::Insert);
        fx.source.push_change("shop.orders", "older", ChangeOp::Insert);
        fx.source.truncate_history("shop.orders");
        fx.ctx
            .coordinator
            .commit_checkpoint(&key, &owner, &progress)
            .await
            .unwrap();

        let acquired = AcquiredPartition {
            progress,
            ..acquired
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(PartitionTask::new(fx.ctx.clone(), acquired, cancel.clone()).run());

        fx.buffer.wait_for_batches(1).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let record = fx.ctx.coordinator.partition(&key).await.unwrap().unwrap();
            if matches!(record.progress.phase, PartitionPhase::Streaming { .. }) {
                assert_eq!(record.progress.resyncs, 1);
                assert_eq!(record.progress.records_exported, 1);
                break;
            }
            assert!(Instant::now() < deadline, "partition never resumed streaming");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        assert!(matches!(handle.await.unwrap(), TaskExit::Stopped));
    }

    #[tokio::test]
    async fn test_lease_loss_stops_task() {
        let clock = Arc::new(ManualClock::new(0));
        let fx = fixture(
            MockSource::new(),
            RecordingBuffer::new(),
            clock.clone(),
            settings(true),
        );
        let acquired = acquire(&fx, "shop.audit", IngestionMode::Stream).await;
        let handle = tokio::spawn(
            PartitionTask::new(fx.ctx.clone(), acquired, CancellationToken::new()).run(),
        );

        clock.advance(Duration::from_secs(60));
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, TaskExit::LeaseLost));
    }
}
