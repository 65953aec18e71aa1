//! Change stream capture for a partition
//!
//! [`StreamWorker::run`] opens the source's change feed after a resume
//! token and yields chunks of whatever events are ready, in source order.
//! Each chunk carries the token of its last event.
//!
//! Transient failures reopen the feed after the last yielded token with
//! backoff. Consecutive failures are bounded. Lost history ends the stream
//! with `StreamResumeImpossible`; the caller must re-export the partition.

use crate::config::StreamSettings;
use crate::error::{IngestError, Result};
use crate::record::SourceRecord;
use crate::resilience::RetryConfig;
use crate::source::{ChangeEvent, SharedChangeStreamSource};
use crate::types::{PartitionKey, ResumeToken};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Item of a change stream
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub records: Vec<SourceRecord>,
    /// Resume point after this chunk
    pub token: ResumeToken,
    /// Events dropped for lacking an id
    pub skipped: u64,
}

/// Stream statistics.
#[derive(Debug, Default)]
pub struct StreamStats {
    events: AtomicU64,
    chunks: AtomicU64,
    skipped: AtomicU64,
    reconnects: AtomicU64,
    resume_failures: AtomicU64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            resume_failures: self.resume_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot for stats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    pub events: u64,
    pub chunks: u64,
    pub skipped: u64,
    pub reconnects: u64,
    pub resume_failures: u64,
}

/// Reads partition change feeds.
pub struct StreamWorker {
    source: SharedChangeStreamSource,
    batch_size: usize,
    retry: RetryConfig,
    stats: Arc<StreamStats>,
}

impl StreamWorker {
    pub fn new(source: SharedChangeStreamSource, settings: &StreamSettings) -> Self {
        Self {
            source,
            batch_size: settings.batch_size.max(1),
            retry: settings.to_retry_config(),
            stats: Arc::new(StreamStats::default()),
        }
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stream changes after `resume` (from the current head if `None`).
    pub fn run(
        &self,
        partition: PartitionKey,
        resume: Option<ResumeToken>,
    ) -> BoxStream<'static, Result<StreamChunk>> {
        let source = Arc::clone(&self.source);
        let retry = self.retry.clone();
        let stats = Arc::clone(&self.stats);
        let batch_size = self.batch_size;

        Box::pin(async_stream::stream! {
            let mut position = resume;
            let mut failures = 0u32;

            loop {
                info!(
                    partition = %partition,
                    resume_from = ?position.as_ref().map(|t| t.as_str()),
                    "Opening change stream"
                );

                let interruption = match source.open(&partition, position.as_ref()).await {
                    Ok(events) => {
                        let mut chunks = events.ready_chunks(batch_size);
                        loop {
                            let Some(items) = chunks.next().await else {
                                break IngestError::source("change stream ended");
                            };

                            let mut records = Vec::with_capacity(items.len());
                            let mut last_token = None;
                            let mut skipped = 0u64;
                            let mut error = None;
                            for item in items {
                                match item {
                                    Ok(event) => {
                                        last_token = Some(event.token.clone());
                                        if event.id.is_empty() {
                                            skipped += 1;
                                        } else {
                                            records.push(to_record(&partition, event));
                                        }
                                    }
                                    Err(e) => {
                                        error = Some(e);
                                        break;
                                    }
                                }
                            }

                            if let Some(token) = last_token {
                                failures = 0;
                                position = Some(token.clone());
                                stats.events.fetch_add(records.len() as u64 + skipped, Ordering::Relaxed);
                                stats.chunks.fetch_add(1, Ordering::Relaxed);
                                stats.skipped.fetch_add(skipped, Ordering::Relaxed);
                                yield Ok(StreamChunk { records, token, skipped });
                            }

                            if let Some(e) = error {
                                break e;
                            }
                        }
                    }
                    Err(e) => e,
                };

                match interruption {
                    IngestError::HistoryLost(reason) => {
                        stats.resume_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(partition = %partition, reason = %reason, "Change stream history lost");
                        yield Err(IngestError::StreamResumeImpossible {
                            partition: partition.clone(),
                            reason,
                        });
                        break;
                    }
                    e if e.is_retriable() && retry.should_retry(failures) => {
                        let delay = retry.delay_for_attempt(failures);
                        failures += 1;
                        stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            partition = %partition,
                            attempt = failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Change stream interrupted, reopening"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    e => {
                        debug!(partition = %partition, failures, "Change stream retries exhausted");
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }
}

fn to_record(partition: &PartitionKey, event: ChangeEvent) -> SourceRecord {
    SourceRecord {
        partition: partition.clone(),
        id: event.id,
        op: event.op,
        document: event.document,
        timestamp_ms: event.timestamp_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ChangeOp;
    use crate::testing::MockSource;
    use std::time::Duration;

    fn settings(batch_size: usize) -> StreamSettings {
        StreamSettings {
            batch_size,
            max_retries: 3,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            retry_jitter: 0.0,
        }
    }

    fn key() -> PartitionKey {
        PartitionKey::new("shop.orders")
    }

    async fn next_chunk(stream: &mut BoxStream<'static, Result<StreamChunk>>) -> Result<StreamChunk> {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_delivers_in_source_order() {
        let source = Arc::new(MockSource::new());
        let start = Some(source.head_token("shop.orders"));
        for id in ["a", "b", "c", "d", "e"] {
            source.push_change("shop.orders", id, ChangeOp::Insert);
        }
        let worker = StreamWorker::new(source.clone(), &settings(2));
        let mut stream = worker.run(key(), start);

        let mut ids = Vec::new();
        let mut last = None;
        while ids.len() < 5 {
            let chunk = next_chunk(&mut stream).await.unwrap();
            assert!(chunk.records.len() <= 2);
            ids.extend(chunk.records.iter().map(|r| r.id.clone()));
            last = Some(chunk.token);
        }
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(last, Some(source.head_token("shop.orders")));
    }

    #[tokio::test]
    async fn test_resumes_after_token() {
        let source = Arc::new(MockSource::new());
        source.push_change("shop.orders", "a", ChangeOp::Insert);
        let after_a = source.push_change("shop.orders", "b", ChangeOp::Update);
        source.push_change("shop.orders", "c", ChangeOp::Delete);

        let worker = StreamWorker::new(source.clone(), &settings(10));
        let mut stream = worker.run(key(), Some(after_a.clone()));
        let chunk = next_chunk(&mut stream).await.unwrap();
        assert_eq!(chunk.records.len(), 1);
        assert_eq!(chunk.records[0].id, "c");
        assert_eq!(chunk.records[0].op, ChangeOp::Delete);
        assert_eq!(source.opened_with(), vec![(key(), Some(after_a))]);
    }

    #[tokio::test]
    async fn test_live_events_arrive_after_open() {
        let source = Arc::new(MockSource::new());
        let worker = StreamWorker::new(source.clone(), &settings(10));
        let mut stream = worker.run(key(), None);

        let pusher = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push_change("shop.orders", "late", ChangeOp::Insert);
        });

        let chunk = next_chunk(&mut stream).await.unwrap();
        assert_eq!(chunk.records[0].id, "late");
    }

    #[tokio::test]
    async fn test_history_loss_is_not_resumable() {
        let source = Arc::new(MockSource::new());
        let old = source.push_change("shop.orders", "a", ChangeOp::Insert);
        source.push_change("shop.orders", "b", ChangeOp::Insert);
        source.truncate_history("shop.orders");

        let worker = StreamWorker::new(source, &settings(10));
        let mut stream = worker.run(key(), Some(old));
        let err = next_chunk(&mut stream).await.unwrap_err();
        assert!(matches!(err, IngestError::StreamResumeImpossible { .. }));
        assert!(stream.next().await.is_none());
        assert_eq!(worker.stats().resume_failures, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_reopen_from_last_token() {
        let source = Arc::new(MockSource::new());
        let start = Some(source.head_token("shop.orders"));
        source.push_change("shop.orders", "a", ChangeOp::Insert);
        let worker = StreamWorker::new(source.clone(), &settings(10));
        let mut stream = worker.run(key(), start);

        let first = next_chunk(&mut stream).await.unwrap();
        assert_eq!(first.records[0].id, "a");

        source.inject_stream_errors(1);
        source.push_change("shop.orders", "b", ChangeOp::Insert);
        let second = next_chunk(&mut stream).await.unwrap();
        assert_eq!(second.records[0].id, "b");

        let opened = source.opened_with();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[1].1, Some(first.token));
        assert_eq!(worker.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_open_failures_exhaust_retries() {
        let source = Arc::new(MockSource::new());
        source.fail_next_opens(10);
        let worker = StreamWorker::new(source, &settings(10));
        let mut stream = worker.run(key(), None);
        let err = next_chunk(&mut stream).await.unwrap_err();
        assert!(matches!(err, IngestError::Source(_)));
    }
}
