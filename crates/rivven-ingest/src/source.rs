//! Source interfaces
//!
//! The crate does not speak any database protocol. A connector implements
//! [`SnapshotSource`] for paged reads of existing documents and
//! [`ChangeStreamSource`] for the ordered change feed.
//!
//! Error contract: transient failures are `IngestError::Source` and are
//! retried with backoff. A change stream that cannot resume from the given
//! token returns `IngestError::HistoryLost`.

use crate::error::Result;
use crate::record::ChangeOp;
use crate::types::{PartitionKey, RecordId, ResumeToken, SnapshotCursor};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A document read during export
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Valid {
        id: RecordId,
        document: serde_json::Value,
    },
    /// Undecodable document; skipped and counted
    Malformed { reason: String },
}

/// One page of a snapshot scan
#[derive(Debug, Clone, Default)]
pub struct SnapshotPage {
    pub records: Vec<RawRecord>,
    /// Position after the last record of this page
    pub next_cursor: Option<SnapshotCursor>,
    /// No records remain after this page
    pub exhausted: bool,
}

/// One event of a change stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Position to resume after this event
    pub token: ResumeToken,
    pub id: RecordId,
    pub op: ChangeOp,
    pub document: Option<serde_json::Value>,
    /// Source timestamp (Unix epoch milliseconds)
    pub timestamp_ms: i64,
}

/// Paged reads of a partition's existing documents.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Current change stream position, captured before an export starts.
    async fn capture_stream_position(&self, partition: &PartitionKey) -> Result<ResumeToken>;

    /// Read up to `limit` documents after `after` (from the start if `None`).
    async fn fetch_page(
        &self,
        partition: &PartitionKey,
        after: Option<&SnapshotCursor>,
        limit: usize,
    ) -> Result<SnapshotPage>;
}

/// Ordered change feed of a partition.
#[async_trait]
pub trait ChangeStreamSource: Send + Sync {
    /// Open the feed after `resume` (at the current head if `None`).
    async fn open(
        &self,
        partition: &PartitionKey,
        resume: Option<&ResumeToken>,
    ) -> Result<BoxStream<'static, Result<ChangeEvent>>>;
}

pub type SharedSnapshotSource = Arc<dyn SnapshotSource>;
pub type SharedChangeStreamSource = Arc<dyn ChangeStreamSource>;
