//! Snapshot (export) of a partition's existing documents
//!
//! [`SnapshotWorker::run`] returns a lazy stream of pages. Each page is
//! read with bounded retries; the stream ends with
//! [`SnapshotEvent::Exhausted`] once the source reports no more documents,
//! or with a single `SnapshotFailed` error. A non-final page that does not
//! move the cursor also fails the snapshot.
//!
//! Resuming: pass the cursor of the last committed chunk and the scan
//! continues after it.

use crate::config::SnapshotSettings;
use crate::error::{IngestError, Result};
use crate::record::SourceRecord;
use crate::resilience::RetryConfig;
use crate::source::{RawRecord, SharedSnapshotSource, SnapshotPage};
use crate::types::{PartitionKey, ResumeToken, SnapshotCursor};
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Item of a snapshot stream
#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    Batch(SnapshotChunk),
    /// All existing documents were read
    Exhausted,
}

/// Decoded page
#[derive(Debug, Clone)]
pub struct SnapshotChunk {
    pub records: Vec<SourceRecord>,
    /// Cursor after this chunk
    pub cursor: Option<SnapshotCursor>,
    /// Malformed documents dropped from this page
    pub skipped: u64,
}

/// Snapshot statistics.
#[derive(Debug, Default)]
pub struct SnapshotStats {
    pages: AtomicU64,
    records: AtomicU64,
    skipped: AtomicU64,
    retries: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl SnapshotStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_page(&self, records: u64, skipped: u64) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(records, Ordering::Relaxed);
        self.skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn record_retries(&self, retries: u64) {
        self.retries.fetch_add(retries, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SnapshotStatsSnapshot {
        SnapshotStatsSnapshot {
            pages: self.pages.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot for stats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStatsSnapshot {
    pub pages: u64,
    pub records: u64,
    pub skipped: u64,
    pub retries: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Reads partitions page by page.
pub struct SnapshotWorker {
    source: SharedSnapshotSource,
    batch_size: usize,
    retry: RetryConfig,
    stats: Arc<SnapshotStats>,
}

impl SnapshotWorker {
    pub fn new(source: SharedSnapshotSource, settings: &SnapshotSettings) -> Self {
        Self {
            source,
            batch_size: settings.batch_size.max(1),
            retry: settings.to_retry_config(),
            stats: Arc::new(SnapshotStats::new()),
        }
    }

    pub fn stats(&self) -> SnapshotStatsSnapshot {
        self.stats.snapshot()
    }

    /// Capture the stream position an export-then-stream partition resumes at.
    pub async fn capture_watermark(&self, partition: &PartitionKey) -> Result<ResumeToken> {
        match self
            .retry
            .run("capture_stream_position", || {
                self.source.capture_stream_position(partition)
            })
            .await
        {
            Ok((token, retries)) => {
                self.stats.record_retries(retries as u64);
                debug!(partition = %partition, watermark = %token, "Captured stream watermark");
                Ok(token)
            }
            Err(failure) => {
                self.stats.record_failed();
                Err(IngestError::SnapshotFailed {
                    partition: partition.clone(),
                    attempts: failure.attempts,
                    reason: failure.last_error.to_string(),
                })
            }
        }
    }

    /// Stream the partition's documents after `cursor`.
    pub fn run(
        &self,
        partition: PartitionKey,
        cursor: Option<SnapshotCursor>,
    ) -> BoxStream<'static, Result<SnapshotEvent>> {
        let source = Arc::clone(&self.source);
        let retry = self.retry.clone();
        let stats = Arc::clone(&self.stats);
        let batch_size = self.batch_size;

        Box::pin(async_stream::stream! {
            let mut cursor = cursor;
            info!(
                partition = %partition,
                resume_from = ?cursor.as_ref().map(|c| c.as_str()),
                "Starting snapshot"
            );

            loop {
                let fetched = retry
                    .run("fetch_page", || {
                        source.fetch_page(&partition, cursor.as_ref(), batch_size)
                    })
                    .await;

                let SnapshotPage { records: raw, next_cursor, exhausted } = match fetched {
                    Ok((page, retries)) => {
                        stats.record_retries(retries as u64);
                        page
                    }
                    Err(failure) => {
                        stats.record_failed();
                        warn!(
                            partition = %partition,
                            attempts = failure.attempts,
                            error = %failure.last_error,
                            "Snapshot failed"
                        );
                        yield Err(IngestError::SnapshotFailed {
                            partition: partition.clone(),
                            attempts: failure.attempts,
                            reason: failure.last_error.to_string(),
                        });
                        break;
                    }
                };

                let advanced = next_cursor.is_some() && next_cursor != cursor;
                if advanced {
                    cursor = next_cursor;
                }

                let (records, skipped) = decode_page(&partition, raw);
                let has_content = !records.is_empty() || skipped > 0;

                // refetching the same position would loop forever
                if has_content && !advanced && !exhausted {
                    stats.record_failed();
                    warn!(
                        partition = %partition,
                        cursor = ?cursor.as_ref().map(|c| c.as_str()),
                        records = records.len(),
                        "Snapshot page did not advance the cursor"
                    );
                    yield Err(IngestError::SnapshotFailed {
                        partition: partition.clone(),
                        attempts: 1,
                        reason: "page did not advance the cursor".to_string(),
                    });
                    break;
                }
                stats.record_page(records.len() as u64, skipped);

                if has_content || advanced {
                    yield Ok(SnapshotEvent::Batch(SnapshotChunk {
                        records,
                        cursor: cursor.clone(),
                        skipped,
                    }));
                }

                if exhausted || !(has_content || advanced) {
                    if !exhausted {
                        debug!(partition = %partition, "Empty page without cursor advance, treating as end of data");
                    }
                    stats.record_completed();
                    info!(partition = %partition, "Snapshot exhausted");
                    yield Ok(SnapshotEvent::Exhausted);
                    break;
                }
            }
        })
    }
}

fn decode_page(partition: &PartitionKey, raw: Vec<RawRecord>) -> (Vec<SourceRecord>, u64) {
    let mut records = Vec::with_capacity(raw.len());
    let mut skipped = 0u64;
    for record in raw {
        match record {
            RawRecord::Valid { id, document } if !id.is_empty() => {
                records.push(SourceRecord::snapshot(partition.clone(), id, document));
            }
            RawRecord::Valid { .. } => {
                skipped += 1;
                debug!(partition = %partition, "Skipping document without id");
            }
            RawRecord::Malformed { reason } => {
                skipped += 1;
                debug!(partition = %partition, reason = %reason, "Skipping malformed document");
            }
        }
    }
    (records, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SnapshotSource;
    use crate::testing::MockSource;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Returns the same non-final page whatever the cursor.
    #[derive(Default)]
    struct StuckSource {
        fetches: AtomicU32,
    }

    #[async_trait]
    impl SnapshotSource for StuckSource {
        async fn capture_stream_position(&self, _partition: &PartitionKey) -> Result<ResumeToken> {
            Ok(ResumeToken::new("00000000"))
        }

        async fn fetch_page(
            &self,
            _partition: &PartitionKey,
            after: Option<&SnapshotCursor>,
            _limit: usize,
        ) -> Result<SnapshotPage> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(SnapshotPage {
                records: vec![RawRecord::Valid {
                    id: "stuck".to_string(),
                    document: serde_json::json!({"_id": "stuck"}),
                }],
                next_cursor: after.cloned(),
                exhausted: false,
            })
        }
    }

    fn settings(batch_size: usize) -> SnapshotSettings {
        SnapshotSettings {
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

    async fn collect(worker: &SnapshotWorker, cursor: Option<SnapshotCursor>) -> Vec<Result<SnapshotEvent>> {
        worker.run(key(), cursor).collect().await
    }

    #[tokio::test]
    async fn test_pages_until_exhausted() {
        let source = Arc::new(MockSource::new().with_documents("shop.orders", 5));
        let worker = SnapshotWorker::new(source.clone(), &settings(2));

        let events = collect(&worker, None).await;
        assert_eq!(events.len(), 4);

        let sizes: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                Ok(SnapshotEvent::Batch(chunk)) => Some(chunk.records.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(matches!(events.last(), Some(Ok(SnapshotEvent::Exhausted))));

        let stats = worker.stats();
        assert_eq!(stats.records, 5);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_resumes_after_cursor() {
        let source = Arc::new(MockSource::new().with_documents("shop.orders", 5));
        let worker = SnapshotWorker::new(source.clone(), &settings(10));

        let events = collect(&worker, Some(SnapshotCursor::new("3"))).await;
        match &events[0] {
            Ok(SnapshotEvent::Batch(chunk)) => {
                let ids: Vec<_> = chunk.records.iter().map(|r| r.id.as_str()).collect();
                assert_eq!(ids, vec!["shop.orders-3", "shop.orders-4"]);
                assert_eq!(chunk.cursor, Some(SnapshotCursor::new("5")));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            source.fetches()[0],
            (key(), Some(SnapshotCursor::new("3")))
        );
    }

    #[tokio::test]
    async fn test_malformed_documents_are_skipped() {
        let source = Arc::new(MockSource::new().with_documents("shop.orders", 2));
        source.add_malformed("shop.orders", "invalid BSON");
        source.add_document("shop.orders", "last", serde_json::json!({"ok": true}));
        let worker = SnapshotWorker::new(source, &settings(10));

        let events = collect(&worker, None).await;
        match &events[0] {
            Ok(SnapshotEvent::Batch(chunk)) => {
                assert_eq!(chunk.records.len(), 3);
                assert_eq!(chunk.skipped, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(worker.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let source = Arc::new(MockSource::new().with_documents("shop.orders", 3));
        source.fail_next_fetches(2);
        let worker = SnapshotWorker::new(source, &settings(10));

        let events = collect(&worker, None).await;
        assert!(events.iter().all(|e| e.is_ok()));
        assert_eq!(worker.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_gives_up_with_snapshot_failed() {
        let source = Arc::new(MockSource::new().with_documents("shop.orders", 3));
        source.fail_next_fetches(10);
        let worker = SnapshotWorker::new(source, &settings(10));

        let events = collect(&worker, None).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Err(IngestError::SnapshotFailed { attempts: 4, .. })
        ));
        assert_eq!(worker.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_page_without_cursor_advance_fails() {
        let source = Arc::new(StuckSource::default());
        let worker = SnapshotWorker::new(source.clone(), &settings(10));

        let events = tokio::time::timeout(Duration::from_secs(5), collect(&worker, None))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Err(IngestError::SnapshotFailed { reason, .. }) => {
                assert!(reason.contains("did not advance"))
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().failed, 1);
        assert_eq!(worker.stats().pages, 0);
    }

    #[tokio::test]
    async fn test_empty_partition_exhausts_immediately() {
        let source = Arc::new(MockSource::new());
        let worker = SnapshotWorker::new(source, &settings(10));
        let events = collect(&worker, None).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(SnapshotEvent::Exhausted)));
    }

    #[tokio::test]
    async fn test_capture_watermark() {
        let source = Arc::new(MockSource::new());
        source.push_change("shop.orders", "a", crate::record::ChangeOp::Insert);
        let worker = SnapshotWorker::new(source.clone(), &settings(10));
        let watermark = worker.capture_watermark(&key()).await.unwrap();
        assert_eq!(watermark, source.head_token("shop.orders"));
    }
}
