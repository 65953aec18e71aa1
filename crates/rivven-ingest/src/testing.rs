//! Testing utilities
//!
//! In-memory doubles for the source and buffer seams, used by the crate's
//! own tests and by connector authors exercising the coordination logic
//! without a database.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_ingest::testing::{MockSource, RecordingBuffer};
//!
//! let source = Arc::new(MockSource::new().with_documents("shop.orders", 100));
//! let buffer = Arc::new(RecordingBuffer::new());
//!
//! let worker = IngestionWorker::new(config, store, source.clone(), source.clone())?;
//! worker.start(buffer.clone()).await?;
//! source.push_change("shop.orders", "order-7", ChangeOp::Update);
//! ```
//!
//! Mock positions are plain counters: the snapshot cursor is the index of
//! the next document and a resume token is the number of change events
//! already seen, zero-padded.

use crate::buffer::Buffer;
use crate::error::{IngestError, Result};
use crate::record::{ChangeOp, RecordBatch, SourceRecord};
use crate::source::{ChangeEvent, ChangeStreamSource, RawRecord, SnapshotPage, SnapshotSource};
use crate::types::{PartitionKey, ResumeToken, SnapshotCursor};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

// ============================================================================
// Mock Source
// ============================================================================

#[derive(Debug, Default)]
struct PartitionData {
    documents: Vec<RawRecord>,
    changes: Vec<ChangeEvent>,
    /// Oldest change position still resumable
    history_floor: usize,
    /// Non-retriable error returned by every page fetch
    permanent_failure: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    partitions: HashMap<PartitionKey, PartitionData>,
    fetch_failures: u32,
    open_failures: u32,
    stream_errors: u32,
    fetches: Vec<(PartitionKey, Option<SnapshotCursor>)>,
    opens: Vec<(PartitionKey, Option<ResumeToken>)>,
}

impl MockState {
    fn partition(&mut self, partition: &PartitionKey) -> &mut PartitionData {
        self.partitions.entry(partition.clone()).or_default()
    }
}

fn position_token(position: usize) -> ResumeToken {
    ResumeToken::new(format!("{:08}", position))
}

/// A mock database implementing both source traits
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `count` documents with ids `{partition}-{n}`.
    pub fn with_documents(self, partition: &str, count: usize) -> Self {
        {
            let mut state = self.state.lock();
            let data = state.partition(&PartitionKey::new(partition));
            let offset = data.documents.len();
            for n in offset..offset + count {
                let id = format!("{}-{}", partition, n);
                data.documents.push(RawRecord::Valid {
                    document: serde_json::json!({ "_id": id, "n": n }),
                    id,
                });
            }
        }
        self
    }

    pub fn add_document(&self, partition: &str, id: &str, document: serde_json::Value) {
        self.state
            .lock()
            .partition(&PartitionKey::new(partition))
            .documents
            .push(RawRecord::Valid {
                id: id.to_string(),
                document,
            });
    }

    pub fn add_malformed(&self, partition: &str, reason: &str) {
        self.state
            .lock()
            .partition(&PartitionKey::new(partition))
            .documents
            .push(RawRecord::Malformed {
                reason: reason.to_string(),
            });
    }

    /// Append a change event and wake open streams. Returns its token.
    pub fn push_change(&self, partition: &str, id: &str, op: ChangeOp) -> ResumeToken {
        let token = {
            let mut state = self.state.lock();
            let data = state.partition(&PartitionKey::new(partition));
            let token = position_token(data.changes.len() + 1);
            data.changes.push(ChangeEvent {
                token: token.clone(),
                id: id.to_string(),
                op,
                document: match op {
                    ChangeOp::Delete => None,
                    _ => Some(serde_json::json!({ "_id": id })),
                },
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            });
            token
        };
        self.notify.notify_waiters();
        token
    }

    /// Token of the newest change event of a partition.
    pub fn head_token(&self, partition: &str) -> ResumeToken {
        let mut state = self.state.lock();
        position_token(state.partition(&PartitionKey::new(partition)).changes.len())
    }

    /// Make every position before the current head unresumable.
    pub fn truncate_history(&self, partition: &str) {
        let mut state = self.state.lock();
        let data = state.partition(&PartitionKey::new(partition));
        data.history_floor = data.changes.len();
    }

    /// Fail the next `n` page fetches with a transient error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().fetch_failures = n;
    }

    /// Fail the next `n` stream opens with a transient error.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().open_failures = n;
    }

    /// Interrupt open streams `n` times with a transient error.
    pub fn inject_stream_errors(&self, n: u32) {
        self.state.lock().stream_errors = n;
        self.notify.notify_waiters();
    }

    /// Fail every page fetch of `partition` with a non-retriable error.
    pub fn fail_snapshot_permanently(&self, partition: &str, reason: &str) {
        self.state
            .lock()
            .partition(&PartitionKey::new(partition))
            .permanent_failure = Some(reason.to_string());
    }

    /// Every page fetch so far, in call order.
    pub fn fetches(&self) -> Vec<(PartitionKey, Option<SnapshotCursor>)> {
        self.state.lock().fetches.clone()
    }

    /// Every stream open so far, in call order.
    pub fn opened_with(&self) -> Vec<(PartitionKey, Option<ResumeToken>)> {
        self.state.lock().opens.clone()
    }
}

#[async_trait]
impl SnapshotSource for MockSource {
    async fn capture_stream_position(&self, partition: &PartitionKey) -> Result<ResumeToken> {
        let mut state = self.state.lock();
        Ok(position_token(state.partition(partition).changes.len()))
    }

    async fn fetch_page(
        &self,
        partition: &PartitionKey,
        after: Option<&SnapshotCursor>,
        limit: usize,
    ) -> Result<SnapshotPage> {
        let mut state = self.state.lock();
        state.fetches.push((partition.clone(), after.cloned()));

        if let Some(reason) = &state.partition(partition).permanent_failure {
            return Err(IngestError::serialization(reason.clone()));
        }
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(IngestError::source("injected fetch failure"));
        }

        let start = match after {
            Some(cursor) => cursor.as_str().parse::<usize>().map_err(|_| {
                IngestError::serialization(format!("invalid snapshot cursor '{}'", cursor))
            })?,
            None => 0,
        };
        let documents = &state.partition(partition).documents;
        let start = start.min(documents.len());
        let end = start.saturating_add(limit).min(documents.len());

        Ok(SnapshotPage {
            records: documents[start..end].to_vec(),
            next_cursor: if end > start {
                Some(SnapshotCursor::new(end.to_string()))
            } else {
                after.cloned()
            },
            exhausted: end >= documents.len(),
        })
    }
}

#[async_trait]
impl ChangeStreamSource for MockSource {
    async fn open(
        &self,
        partition: &PartitionKey,
        resume: Option<&ResumeToken>,
    ) -> Result<BoxStream<'static, Result<ChangeEvent>>> {
        let start = {
            let mut state = self.state.lock();
            state.opens.push((partition.clone(), resume.cloned()));
            if state.open_failures > 0 {
                state.open_failures -= 1;
                return Err(IngestError::source("injected open failure"));
            }

            let data = state.partition(partition);
            match resume {
                None => data.changes.len(),
                Some(token) => {
                    let position = token.as_str().parse::<usize>().map_err(|_| {
                        IngestError::history_lost(format!("unrecognized resume token '{}'", token))
                    })?;
                    if position < data.history_floor || position > data.changes.len() {
                        return Err(IngestError::history_lost(format!(
                            "resume token '{}' is no longer in the change history",
                            token
                        )));
                    }
                    position
                }
            }
        };

        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);
        let partition = partition.clone();

        Ok(Box::pin(async_stream::stream! {
            let mut position = start;
            loop {
                let notified = notify.notified();
                let next = {
                    let mut state = state.lock();
                    if state.stream_errors > 0 {
                        state.stream_errors -= 1;
                        Some(Err(IngestError::source("injected stream interruption")))
                    } else {
                        state
                            .partitions
                            .get(&partition)
                            .and_then(|data| data.changes.get(position).cloned())
                            .map(Ok)
                    }
                };

                match next {
                    Some(Ok(event)) => {
                        position += 1;
                        yield Ok(event);
                    }
                    Some(Err(e)) => yield Err(e),
                    None => notified.await,
                }
            }
        }))
    }
}

// ============================================================================
// Recording Buffer
// ============================================================================

/// How [`RecordingBuffer`] answers enqueued batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge on enqueue
    Auto,
    /// Leave acknowledgement to the test
    Manual,
}

#[derive(Debug, Default)]
struct RecordingState {
    batches: Vec<RecordBatch>,
    reject_next: u32,
}

/// A buffer that keeps every batch it receives
#[derive(Debug)]
pub struct RecordingBuffer {
    state: Mutex<RecordingState>,
    policy: AckPolicy,
    notify: Notify,
}

impl Default for RecordingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBuffer {
    /// Buffer that acknowledges every batch on arrival.
    pub fn new() -> Self {
        Self::with_policy(AckPolicy::Auto)
    }

    pub fn manual() -> Self {
        Self::with_policy(AckPolicy::Manual)
    }

    pub fn with_policy(policy: AckPolicy) -> Self {
        Self {
            state: Mutex::new(RecordingState::default()),
            policy,
            notify: Notify::new(),
        }
    }

    /// Reject the next `n` batches instead of acknowledging them.
    pub fn reject_next(&self, n: u32) {
        self.state.lock().reject_next = n;
    }

    pub fn batches(&self) -> Vec<RecordBatch> {
        self.state.lock().batches.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All received records, in arrival order.
    pub fn records(&self) -> Vec<SourceRecord> {
        self.state
            .lock()
            .batches
            .iter()
            .flat_map(|b| b.records.iter().cloned())
            .collect()
    }

    pub fn record_ids(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.id).collect()
    }

    /// Acknowledge every batch received so far.
    pub fn acknowledge_all(&self) {
        for batch in self.state.lock().batches.iter() {
            batch.acknowledge();
        }
    }

    /// Wait until at least `count` batches arrived.
    pub async fn wait_for_batches(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Buffer for RecordingBuffer {
    async fn enqueue(&self, batch: RecordBatch) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.reject_next > 0 {
                state.reject_next -= 1;
                batch.reject();
            } else if self.policy == AckPolicy::Auto {
                batch.acknowledge();
            }
            state.batches.push(batch);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
