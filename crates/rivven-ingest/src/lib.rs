//! # rivven-ingest - Coordinated CDC ingestion for Rivven
//!
//! Splits change capture of a document database into per-collection
//! partitions and runs them across a group of interchangeable workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  conditional writes  ┌──────────────────────┐
//! │   Worker A   │◄────────────────────►│ PartitionStateStore  │
//! │   Worker B   │   (leases, progress) │ (shared, versioned)  │
//! └──────┬───────┘                      └──────────────────────┘
//!        │ one PartitionTask per leased partition
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Snapshot /   │──►│    Buffer    │──►│  Consumers   │
//! │ StreamWorker │   │  (enqueue)   │   │              │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!        ▲                                     │ AckHandle
//!        └──── AcknowledgementGate ◄───────────┘
//!              (commits acknowledged prefixes)
//! ```
//!
//! Each partition runs in one of three ingestion modes: `export` (snapshot
//! only), `stream` (change feed only) or `export_then_stream` (snapshot,
//! then the change feed from a watermark captured before the snapshot).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_ingest::{ChannelBuffer, IngestionWorker, SourceConfig};
//!
//! let config = SourceConfig::from_file("rivven-ingest.yaml").await?;
//! let store = config.store.open().await?;
//! let worker = IngestionWorker::new(config, store, snapshot_source, stream_source)?;
//!
//! let (buffer, mut batches) = ChannelBuffer::bounded(64);
//! worker.start(Arc::new(buffer)).await?;
//! while let Some(batch) = batches.recv().await {
//!     publish(&batch.records).await?;
//!     batch.acknowledge();
//! }
//! worker.stop().await?;
//! ```

pub mod ack;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mode;
pub mod partition;
pub mod record;
pub mod resilience;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod stream;
pub mod task;
pub mod testing;
pub mod types;
pub mod validation;
pub mod worker;

pub use ack::{AckEvent, AckHandle, AckToken, AcknowledgementGate, GateDecision, GateStats};
pub use buffer::{Buffer, ChannelBuffer, SharedBuffer};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    AckConfig, AcquisitionConfig, CollectionConfig, LeaseConfig, SnapshotSettings, SourceConfig,
    StoreConfig, StreamSettings,
};
pub use coordinator::PartitionCoordinator;
pub use error::{ErrorCategory, IngestError, Result};
pub use mode::{IngestionModeController, PartitionPhase};
pub use partition::{AcquiredPartition, Lease, PartitionProgress, PartitionRecord};
pub use record::{ChangeOp, RecordBatch, SourceRecord};
pub use resilience::{ExponentialBackoff, RetryConfig};
pub use snapshot::{SnapshotChunk, SnapshotEvent, SnapshotWorker};
pub use source::{ChangeEvent, ChangeStreamSource, RawRecord, SnapshotPage, SnapshotSource};
pub use store::{
    FileStateStore, MemoryStateStore, PartitionStateStore, SharedStateStore, Version, Versioned,
    WriteOutcome,
};
pub use stream::{StreamChunk, StreamWorker};
pub use task::{PartitionTask, TaskExit};
pub use types::{IngestionMode, OwnerId, PartitionKey, ResumeToken, SnapshotCursor};
pub use validation::{CollectionSpec, CollectionValidator};
pub use worker::IngestionWorker;
