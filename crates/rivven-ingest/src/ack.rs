//! Acknowledgement-gated checkpointing
//!
//! Each partition task owns one [`AcknowledgementGate`]. Every emitted
//! batch is tracked with the progress it would commit (its candidate).
//! Consumers report outcomes through a cloneable [`AckHandle`], which sends
//! [`AckEvent`]s back to the partition task over a channel; the task feeds
//! them into the gate and acts on the returned [`GateDecision`].
//!
//! Commits follow checkpoint order, not arrival order. With batches 1, 2, 3
//! in flight and acknowledgements arriving as 2, 1, 3:
//!
//! ```text
//! ack 2  -> Pending       (1 still outstanding)
//! ack 1  -> Commit(2)     (1 and 2 form an acknowledged prefix)
//! ack 3  -> Commit(3)
//! ```
//!
//! A negative acknowledgement or timeout drops every in-flight batch and
//! asks for redelivery from the last committed candidate. Late events for
//! dropped batches are ignored.

use crate::error::{IngestError, Result};
use crate::partition::PartitionProgress;
use crate::types::{PartitionKey, RecordId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Identifies one tracked batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckToken(u64);

impl std::fmt::Display for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ack-{}", self.0)
    }
}

/// Outcome reported by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    /// Whole-batch outcome
    Batch { token: AckToken, positive: bool },
    /// Single-record outcome
    Record {
        token: AckToken,
        record_id: RecordId,
        positive: bool,
    },
}

/// Receiving side of a gate's event channel
pub type AckReceiver = mpsc::UnboundedReceiver<AckEvent>;

/// Handle given to consumers of one batch.
#[derive(Debug, Clone)]
pub struct AckHandle {
    token: AckToken,
    tx: mpsc::UnboundedSender<AckEvent>,
}

impl AckHandle {
    pub fn token(&self) -> AckToken {
        self.token
    }

    pub fn ack(&self) {
        self.send(AckEvent::Batch {
            token: self.token,
            positive: true,
        });
    }

    pub fn nack(&self) {
        self.send(AckEvent::Batch {
            token: self.token,
            positive: false,
        });
    }

    pub fn ack_record(&self, record_id: impl Into<RecordId>) {
        self.send(AckEvent::Record {
            token: self.token,
            record_id: record_id.into(),
            positive: true,
        });
    }

    pub fn nack_record(&self, record_id: impl Into<RecordId>) {
        self.send(AckEvent::Record {
            token: self.token,
            record_id: record_id.into(),
            positive: false,
        });
    }

    fn send(&self, event: AckEvent) {
        if self.tx.send(event).is_err() {
            trace!(token = %self.token, "Acknowledgement dropped, partition task is gone");
        }
    }
}

/// What the partition task must do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Nothing to commit yet
    Pending,
    /// Persist this progress
    Commit(PartitionProgress),
    /// In-flight batches were dropped; resume from this progress
    Redeliver { from: PartitionProgress },
}

/// Gate counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub tracked: u64,
    pub commits: u64,
    pub redeliveries: u64,
    pub ignored_events: u64,
}

#[derive(Debug)]
struct TrackedBatch {
    token: AckToken,
    candidate: PartitionProgress,
    pending: HashSet<RecordId>,
    acked: bool,
    tracked_at: Instant,
}

/// Per-partition tracker of in-flight batches.
#[derive(Debug)]
pub struct AcknowledgementGate {
    partition: PartitionKey,
    timeout: Duration,
    next_token: u64,
    /// In flight, keyed by candidate checkpoint sequence
    in_flight: BTreeMap<u64, TrackedBatch>,
    tokens: HashMap<AckToken, u64>,
    committed: PartitionProgress,
    tx: mpsc::UnboundedSender<AckEvent>,
    stats: GateStats,
}

impl AcknowledgementGate {
    /// Create a gate starting from the last committed progress.
    pub fn new(
        partition: PartitionKey,
        committed: PartitionProgress,
        timeout: Duration,
    ) -> (Self, AckReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Self {
            partition,
            timeout,
            next_token: 1,
            in_flight: BTreeMap::new(),
            tokens: HashMap::new(),
            committed,
            tx,
            stats: GateStats::default(),
        };
        (gate, rx)
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// Last candidate released for commit (or the starting progress).
    pub fn last_committed(&self) -> &PartitionProgress {
        &self.committed
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_drained(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }

    /// Track a batch about to be handed to the buffer.
    ///
    /// An empty `record_ids` marks a batch that is acknowledged on creation,
    /// used for phase markers. It still commits only behind earlier batches.
    pub fn track(
        &mut self,
        candidate: PartitionProgress,
        record_ids: Vec<RecordId>,
    ) -> Result<AckHandle> {
        self.track_at(candidate, record_ids, Instant::now())
    }

    pub fn track_at(
        &mut self,
        candidate: PartitionProgress,
        record_ids: Vec<RecordId>,
        now: Instant,
    ) -> Result<AckHandle> {
        let floor = self
            .in_flight
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(self.committed.checkpoint_seq);
        if candidate.checkpoint_seq <= floor {
            return Err(IngestError::StaleCheckpoint {
                partition: self.partition.clone(),
                committed: floor,
                attempted: candidate.checkpoint_seq,
            });
        }

        let token = AckToken(self.next_token);
        self.next_token += 1;

        let pending: HashSet<RecordId> = record_ids.into_iter().collect();
        let seq = candidate.checkpoint_seq;
        self.in_flight.insert(
            seq,
            TrackedBatch {
                token,
                candidate,
                acked: pending.is_empty(),
                pending,
                tracked_at: now,
            },
        );
        self.tokens.insert(token, seq);
        self.stats.tracked += 1;

        trace!(partition = %self.partition, %token, seq, "Tracking batch");
        Ok(AckHandle {
            token,
            tx: self.tx.clone(),
        })
    }

    /// Whole batch acknowledged.
    pub fn on_positive_ack(&mut self, token: AckToken) -> GateDecision {
        let Some(batch) = self.lookup(token) else {
            return GateDecision::Pending;
        };
        batch.acked = true;
        batch.pending.clear();
        self.advance()
    }

    /// One record of a batch acknowledged.
    pub fn on_record_ack(&mut self, token: AckToken, record_id: &str) -> GateDecision {
        let Some(batch) = self.lookup(token) else {
            return GateDecision::Pending;
        };
        batch.pending.remove(record_id);
        if batch.pending.is_empty() {
            batch.acked = true;
        }
        self.advance()
    }

    /// Batch rejected or timed out: drop everything in flight.
    pub fn on_negative_ack_or_timeout(&mut self, token: AckToken) -> GateDecision {
        if !self.tokens.contains_key(&token) {
            self.stats.ignored_events += 1;
            debug!(partition = %self.partition, %token, "Ignoring negative ack for untracked batch");
            return GateDecision::Pending;
        }

        let dropped = self.drop_in_flight();
        self.stats.redeliveries += 1;
        warn!(
            partition = %self.partition,
            %token,
            dropped,
            from_seq = self.committed.checkpoint_seq,
            "Batch not acknowledged, redelivering from last checkpoint"
        );
        GateDecision::Redeliver {
            from: self.committed.clone(),
        }
    }

    /// Treat the oldest unacknowledged batch past the timeout as rejected.
    pub fn expire(&mut self, now: Instant) -> GateDecision {
        let timed_out = self
            .in_flight
            .values()
            .find(|b| !b.acked && now.saturating_duration_since(b.tracked_at) >= self.timeout)
            .map(|b| b.token);

        match timed_out {
            Some(token) => {
                warn!(
                    partition = %self.partition,
                    %token,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Acknowledgement timed out"
                );
                self.on_negative_ack_or_timeout(token)
            }
            None => GateDecision::Pending,
        }
    }

    /// Dispatch an event from the channel.
    pub fn apply(&mut self, event: AckEvent) -> GateDecision {
        match event {
            AckEvent::Batch {
                token,
                positive: true,
            } => self.on_positive_ack(token),
            AckEvent::Batch {
                token,
                positive: false,
            } => self.on_negative_ack_or_timeout(token),
            AckEvent::Record {
                token,
                record_id,
                positive: true,
            } => self.on_record_ack(token, &record_id),
            AckEvent::Record {
                token,
                positive: false,
                ..
            } => self.on_negative_ack_or_timeout(token),
        }
    }

    /// Forget all in-flight batches without committing (lease lost, shutdown).
    pub fn abandon(&mut self) -> usize {
        let dropped = self.drop_in_flight();
        if dropped > 0 {
            debug!(partition = %self.partition, dropped, "Abandoned in-flight batches");
        }
        dropped
    }

    fn lookup(&mut self, token: AckToken) -> Option<&mut TrackedBatch> {
        match self.tokens.get(&token) {
            Some(seq) => self.in_flight.get_mut(seq),
            None => {
                self.stats.ignored_events += 1;
                trace!(partition = %self.partition, %token, "Ignoring ack for untracked batch");
                None
            }
        }
    }

    fn drop_in_flight(&mut self) -> usize {
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        self.tokens.clear();
        dropped
    }

    /// Release the longest acknowledged prefix in checkpoint order.
    fn advance(&mut self) -> GateDecision {
        let mut latest = None;
        while let Some(entry) = self.in_flight.first_entry() {
            if !entry.get().acked {
                break;
            }
            let batch = entry.remove();
            self.tokens.remove(&batch.token);
            latest = Some(batch.candidate);
        }

        match latest {
            Some(candidate) => {
                self.committed = candidate.clone();
                self.stats.commits += 1;
                GateDecision::Commit(candidate)
            }
            None => GateDecision::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::PartitionPhase;
    use crate::types::{ResumeToken, SnapshotCursor};

    fn key() -> PartitionKey {
        PartitionKey::new("orders.items")
    }

    fn candidate(seq: u64) -> PartitionProgress {
        let mut progress = PartitionProgress::new(PartitionPhase::Exporting {
            cursor: Some(SnapshotCursor::new(format!("page-{}", seq))),
            watermark: Some(ResumeToken::new("wm")),
        });
        progress.checkpoint_seq = seq;
        progress.records_exported = seq * 10;
        progress
    }

    fn ids(prefix: &str, n: usize) -> Vec<RecordId> {
        (0..n).map(|i| format!("{}-{}", prefix, i)).collect()
    }

    fn gate() -> (AcknowledgementGate, AckReceiver) {
        AcknowledgementGate::new(
            key(),
            PartitionProgress::new(PartitionPhase::PendingExport),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_out_of_order_acks_commit_in_checkpoint_order() {
        let (mut gate, _rx) = gate();
        let b1 = gate.track(candidate(1), ids("a", 3)).unwrap();
        let b2 = gate.track(candidate(2), ids("b", 3)).unwrap();
        let b3 = gate.track(candidate(3), ids("c", 3)).unwrap();

        assert_eq!(gate.on_positive_ack(b2.token()), GateDecision::Pending);
        assert_eq!(gate.last_committed().checkpoint_seq, 0);

        assert_eq!(
            gate.on_positive_ack(b1.token()),
            GateDecision::Commit(candidate(2))
        );
        assert_eq!(
            gate.on_positive_ack(b3.token()),
            GateDecision::Commit(candidate(3))
        );
        assert!(gate.is_drained());
        assert_eq!(gate.last_committed(), &candidate(3));
        assert_eq!(gate.stats().commits, 2);
    }

    #[test]
    fn test_record_level_acks_complete_batch() {
        let (mut gate, _rx) = gate();
        let b1 = gate.track(candidate(1), ids("a", 2)).unwrap();

        assert_eq!(gate.on_record_ack(b1.token(), "a-0"), GateDecision::Pending);
        // duplicate ack of the same record is harmless
        assert_eq!(gate.on_record_ack(b1.token(), "a-0"), GateDecision::Pending);
        assert_eq!(
            gate.on_record_ack(b1.token(), "a-1"),
            GateDecision::Commit(candidate(1))
        );
    }

    #[test]
    fn test_each_batch_commits_at_most_once() {
        let (mut gate, _rx) = gate();
        let b1 = gate.track(candidate(1), ids("a", 1)).unwrap();
        assert_eq!(
            gate.on_positive_ack(b1.token()),
            GateDecision::Commit(candidate(1))
        );
        assert_eq!(gate.on_positive_ack(b1.token()), GateDecision::Pending);
        assert_eq!(gate.stats().ignored_events, 1);
    }

    #[test]
    fn test_negative_ack_redelivers_from_committed() {
        let (mut gate, _rx) = gate();
        let b1 = gate.track(candidate(1), ids("a", 1)).unwrap();
        let b2 = gate.track(candidate(2), ids("b", 1)).unwrap();
        let b3 = gate.track(candidate(3), ids("c", 1)).unwrap();

        gate.on_positive_ack(b1.token());
        let decision = gate.on_negative_ack_or_timeout(b2.token());
        assert_eq!(
            decision,
            GateDecision::Redeliver {
                from: candidate(1)
            }
        );
        assert!(gate.is_drained());

        // late ack for a dropped batch must not commit
        assert_eq!(gate.on_positive_ack(b3.token()), GateDecision::Pending);
        assert_eq!(gate.last_committed(), &candidate(1));

        // redelivered batch reuses the next sequence
        let again = gate.track(candidate(2), ids("b", 1)).unwrap();
        assert_eq!(
            gate.on_positive_ack(again.token()),
            GateDecision::Commit(candidate(2))
        );
    }

    #[test]
    fn test_timeout_triggers_redelivery() {
        let (mut gate, _rx) = gate();
        let start = Instant::now();
        let b1 = gate.track_at(candidate(1), ids("a", 1), start).unwrap();
        gate.track_at(candidate(2), ids("b", 1), start + Duration::from_secs(10))
            .unwrap();

        assert_eq!(
            gate.expire(start + Duration::from_secs(29)),
            GateDecision::Pending
        );
        gate.on_positive_ack(b1.token());
        // batch 2 tracked at +10s times out at +40s
        assert_eq!(
            gate.expire(start + Duration::from_secs(35)),
            GateDecision::Pending
        );
        assert_eq!(
            gate.expire(start + Duration::from_secs(40)),
            GateDecision::Redeliver {
                from: candidate(1)
            }
        );
        assert_eq!(gate.stats().redeliveries, 1);
    }

    #[test]
    fn test_marker_commits_behind_pending_batches() {
        let (mut gate, _rx) = gate();
        let b1 = gate.track(candidate(1), ids("a", 1)).unwrap();

        let mut done = PartitionProgress::new(PartitionPhase::Done);
        done.checkpoint_seq = 2;
        let marker = gate.track(done.clone(), Vec::new()).unwrap();

        assert_eq!(gate.on_positive_ack(marker.token()), GateDecision::Pending);
        assert_eq!(gate.on_positive_ack(b1.token()), GateDecision::Commit(done));
    }

    #[test]
    fn test_rejects_non_increasing_candidates() {
        let (mut gate, _rx) = gate();
        gate.track(candidate(2), ids("a", 1)).unwrap();
        assert!(matches!(
            gate.track(candidate(2), ids("b", 1)),
            Err(IngestError::StaleCheckpoint {
                committed: 2,
                attempted: 2,
                ..
            })
        ));
        assert!(gate.track(candidate(1), ids("b", 1)).is_err());
    }

    #[tokio::test]
    async fn test_handle_sends_events_over_channel() {
        let (mut gate, mut rx) = gate();
        let handle = gate.track(candidate(1), ids("a", 2)).unwrap();

        let consumer = handle.clone();
        tokio::spawn(async move {
            consumer.ack_record("a-1");
            consumer.ack_record("a-0");
        })
        .await
        .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(gate.apply(first), GateDecision::Pending);
        let second = rx.recv().await.unwrap();
        assert_eq!(gate.apply(second), GateDecision::Commit(candidate(1)));
    }

    #[test]
    fn test_abandon_drops_tracking() {
        let (mut gate, _rx) = gate();
        let b1 = gate.track(candidate(1), ids("a", 1)).unwrap();
        gate.track(candidate(2), ids("b", 1)).unwrap();
        assert_eq!(gate.abandon(), 2);
        assert_eq!(gate.on_positive_ack(b1.token()), GateDecision::Pending);
        assert_eq!(gate.last_committed().checkpoint_seq, 0);
    }
}
