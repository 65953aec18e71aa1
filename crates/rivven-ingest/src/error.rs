//! Error types for ingestion coordination
//!
//! Every steady-state failure is classified so callers can decide between
//! retrying locally, releasing a single partition, or aborting startup.

use crate::types::PartitionKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Lease and partition ownership errors
    Coordination,
    /// Source read errors (snapshot pages, change streams)
    Source,
    /// Partition-state store errors
    Storage,
    /// Downstream buffer errors
    Buffer,
    /// Configuration errors (invalid settings, identifiers)
    Configuration,
    /// Serialization errors (JSON, YAML)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Ingestion errors
#[derive(Error, Debug)]
pub enum IngestError {
    /// No partition is unassigned or expired right now
    #[error("No available partition to acquire")]
    NoAvailablePartition,

    /// Another owner holds the lease, or ours expired
    #[error("Lease lost for partition {partition}")]
    LeaseLost { partition: PartitionKey },

    /// Snapshot gave up after bounded retries
    #[error("Snapshot failed for partition {partition} after {attempts} attempt(s): {reason}")]
    SnapshotFailed {
        partition: PartitionKey,
        attempts: u32,
        reason: String,
    },

    /// Change stream cannot continue from the stored token
    #[error("Stream for partition {partition} cannot be resumed: {reason}")]
    StreamResumeImpossible {
        partition: PartitionKey,
        reason: String,
    },

    /// Configured partition name is malformed
    #[error("Invalid partition identifier '{identifier}': {reason}")]
    InvalidPartitionIdentifier { identifier: String, reason: String },

    /// Illegal ingestion phase transition
    #[error("Invalid state transition for partition {partition}: cannot {event} from {from}")]
    InvalidStateTransition {
        partition: PartitionKey,
        from: String,
        event: &'static str,
    },

    /// Checkpoint sequence would move backwards
    #[error(
        "Stale checkpoint for partition {partition}: committed {committed}, attempted {attempted}"
    )]
    StaleCheckpoint {
        partition: PartitionKey,
        committed: u64,
        attempted: u64,
    },

    /// Partition has no record in the state store
    #[error("Partition not found: {0}")]
    PartitionNotFound(PartitionKey),

    /// State store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Transient source failure
    #[error("Source error: {0}")]
    Source(String),

    /// Source no longer retains the history needed to resume
    #[error("Source history lost: {0}")]
    HistoryLost(String),

    /// Downstream buffer rejected or closed
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Work was cancelled by shutdown
    #[error("Shutdown requested")]
    Shutdown,
}

impl IngestError {
    pub fn lease_lost(partition: &PartitionKey) -> Self {
        Self::LeaseLost {
            partition: partition.clone(),
        }
    }

    pub fn invalid_identifier(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPartitionIdentifier {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    pub fn history_lost(msg: impl Into<String>) -> Self {
        Self::HistoryLost(msg.into())
    }

    pub fn buffer(msg: impl Into<String>) -> Self {
        Self::Buffer(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::NoAvailablePartition
            | Self::Source(_)
            | Self::Store(_)
            | Self::Timeout(_) => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::WouldBlock
                )
            }

            Self::LeaseLost { .. }
            | Self::SnapshotFailed { .. }
            | Self::StreamResumeImpossible { .. }
            | Self::InvalidPartitionIdentifier { .. }
            | Self::InvalidStateTransition { .. }
            | Self::StaleCheckpoint { .. }
            | Self::PartitionNotFound(_)
            | Self::HistoryLost(_)
            | Self::Buffer(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Shutdown => false,
        }
    }

    /// Errors that end work on one partition without affecting the others.
    pub fn is_partition_scoped(&self) -> bool {
        matches!(
            self,
            Self::LeaseLost { .. }
                | Self::SnapshotFailed { .. }
                | Self::StreamResumeImpossible { .. }
                | Self::InvalidStateTransition { .. }
                | Self::StaleCheckpoint { .. }
                | Self::PartitionNotFound(_)
        )
    }

    /// Errors that must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidPartitionIdentifier { .. } | Self::Config(_)
        )
    }

    /// Get the error category for logging and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoAvailablePartition => ErrorCategory::Coordination,
            Self::LeaseLost { .. } => ErrorCategory::Coordination,
            Self::InvalidStateTransition { .. } => ErrorCategory::Coordination,
            Self::StaleCheckpoint { .. } => ErrorCategory::Coordination,
            Self::PartitionNotFound(_) => ErrorCategory::Coordination,
            Self::SnapshotFailed { .. } => ErrorCategory::Source,
            Self::StreamResumeImpossible { .. } => ErrorCategory::Source,
            Self::Source(_) => ErrorCategory::Source,
            Self::HistoryLost(_) => ErrorCategory::Source,
            Self::Store(_) => ErrorCategory::Storage,
            Self::Io(_) => ErrorCategory::Storage,
            Self::Buffer(_) => ErrorCategory::Buffer,
            Self::InvalidPartitionIdentifier { .. } => ErrorCategory::Configuration,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Yaml(_) => ErrorCategory::Serialization,
            Self::Timeout(_) => ErrorCategory::Other,
            Self::Shutdown => ErrorCategory::Other,
        }
    }

    /// Get a log-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoAvailablePartition => "no_available_partition",
            Self::LeaseLost { .. } => "lease_lost",
            Self::SnapshotFailed { .. } => "snapshot_failed",
            Self::StreamResumeImpossible { .. } => "stream_resume_impossible",
            Self::InvalidPartitionIdentifier { .. } => "invalid_partition_identifier",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::StaleCheckpoint { .. } => "stale_checkpoint",
            Self::PartitionNotFound(_) => "partition_not_found",
            Self::Store(_) => "store_error",
            Self::Source(_) => "source_error",
            Self::HistoryLost(_) => "history_lost",
            Self::Buffer(_) => "buffer_error",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;
