//! Records and batches handed to the buffer

use crate::ack::AckHandle;
use crate::types::{PartitionKey, RecordId};
use serde::{Deserialize, Serialize};

/// Change operation carried by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Existing document read during export
    Snapshot,
    Insert,
    Update,
    Replace,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

/// One record read from a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub partition: PartitionKey,
    pub id: RecordId,
    pub op: ChangeOp,
    /// Document body; `None` for deletes
    pub document: Option<serde_json::Value>,
    /// Source timestamp (Unix epoch milliseconds)
    pub timestamp_ms: i64,
}

impl SourceRecord {
    pub fn snapshot(
        partition: PartitionKey,
        id: impl Into<RecordId>,
        document: serde_json::Value,
    ) -> Self {
        Self {
            partition,
            id: id.into(),
            op: ChangeOp::Snapshot,
            document: Some(document),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A batch of records from one partition.
///
/// Consumers acknowledge through the attached handle; batches without one
/// were emitted with acknowledgements disabled.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub partition: PartitionKey,
    /// Checkpoint sequence this batch advances the partition to
    pub sequence: u64,
    pub records: Vec<SourceRecord>,
    ack: Option<AckHandle>,
}

impl RecordBatch {
    pub fn new(
        partition: PartitionKey,
        sequence: u64,
        records: Vec<SourceRecord>,
        ack: Option<AckHandle>,
    ) -> Self {
        Self {
            partition,
            sequence,
            records,
            ack,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ack_handle(&self) -> Option<&AckHandle> {
        self.ack.as_ref()
    }

    /// Positive acknowledgement of the whole batch.
    pub fn acknowledge(&self) {
        if let Some(ack) = &self.ack {
            ack.ack();
        }
    }

    /// Negative acknowledgement; the partition redelivers from its last checkpoint.
    pub fn reject(&self) {
        if let Some(ack) = &self.ack {
            ack.nack();
        }
    }
}
