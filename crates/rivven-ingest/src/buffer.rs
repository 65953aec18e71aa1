//! Downstream buffer interface

use crate::error::{IngestError, Result};
use crate::record::RecordBatch;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where partition tasks hand off record batches.
///
/// `enqueue` may suspend to signal backpressure. Consumers acknowledge
/// through the batch's [`AckHandle`](crate::ack::AckHandle).
#[async_trait]
pub trait Buffer: Send + Sync {
    async fn enqueue(&self, batch: RecordBatch) -> Result<()>;
}

/// Shared buffer handle
pub type SharedBuffer = Arc<dyn Buffer>;

/// Bounded tokio channel buffer.
#[derive(Debug, Clone)]
pub struct ChannelBuffer {
    tx: mpsc::Sender<RecordBatch>,
}

impl ChannelBuffer {
    /// Buffer holding at most `capacity` batches; enqueue waits when full.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<RecordBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Buffer for ChannelBuffer {
    async fn enqueue(&self, batch: RecordBatch) -> Result<()> {
        self.tx
            .send(batch)
            .await
            .map_err(|_| IngestError::buffer("buffer receiver closed"))
    }
}
