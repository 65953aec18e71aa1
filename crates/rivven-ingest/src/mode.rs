//! Per-partition ingestion phase machine
//!
//! The configured [`IngestionMode`] decides which phases a partition runs
//! through:
//!
//! | Mode                 | Phases                                                 |
//! |----------------------|--------------------------------------------------------|
//! | `export`             | `PendingExport → Exporting → Done`                     |
//! | `stream`             | `StreamOnly` (until decommissioned)                    |
//! | `export_then_stream` | `PendingExport → Exporting → PendingStream → Streaming`|
//!
//! The stream position captured before the first export page (the
//! watermark) travels through `Exporting` and `PendingStream` and becomes
//! the first resume token of `Streaming`. Events between the watermark and
//! the end of the export may be delivered twice; nothing is skipped.
//!
//! A stream whose history was truncated goes back to `PendingExport` via
//! [`IngestionModeController::resync`]. It is the only backward edge.

use crate::error::{IngestError, Result};
use crate::types::{IngestionMode, PartitionKey, ResumeToken, SnapshotCursor};
use serde::{Deserialize, Serialize};

/// Persisted ingestion phase of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PartitionPhase {
    /// Waiting for the first export page
    PendingExport,
    /// Export running; `cursor` is the last delivered page boundary
    Exporting {
        cursor: Option<SnapshotCursor>,
        watermark: Option<ResumeToken>,
    },
    /// Export finished; stream starts at `start`
    PendingStream { start: Option<ResumeToken> },
    /// Streaming after an export
    Streaming { token: Option<ResumeToken> },
    /// Streaming without an export
    StreamOnly { token: Option<ResumeToken> },
    /// Terminal
    Done,
}

impl PartitionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PendingExport => "pending_export",
            Self::Exporting { .. } => "exporting",
            Self::PendingStream { .. } => "pending_stream",
            Self::Streaming { .. } => "streaming",
            Self::StreamOnly { .. } => "stream_only",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. } | Self::StreamOnly { .. })
    }

    /// Snapshot cursor to resume the export from, if exporting.
    pub fn cursor(&self) -> Option<&SnapshotCursor> {
        match self {
            Self::Exporting { cursor, .. } => cursor.as_ref(),
            _ => None,
        }
    }

    /// Change stream position to resume from, if streaming or about to.
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        match self {
            Self::PendingStream { start } => start.as_ref(),
            Self::Streaming { token } | Self::StreamOnly { token } => token.as_ref(),
            _ => None,
        }
    }
}

impl std::fmt::Display for PartitionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Checks and applies phase transitions for one partition.
#[derive(Debug, Clone)]
pub struct IngestionModeController {
    partition: PartitionKey,
    mode: IngestionMode,
    phase: PartitionPhase,
}

impl IngestionModeController {
    /// Phase a freshly registered partition starts in.
    pub fn initial_phase(mode: IngestionMode) -> PartitionPhase {
        match mode {
            IngestionMode::Export | IngestionMode::ExportThenStream => {
                PartitionPhase::PendingExport
            }
            IngestionMode::Stream => PartitionPhase::StreamOnly { token: None },
        }
    }

    /// Resume a controller from a persisted phase.
    pub fn new(partition: PartitionKey, mode: IngestionMode, phase: PartitionPhase) -> Self {
        Self {
            partition,
            mode,
            phase,
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn mode(&self) -> IngestionMode {
        self.mode
    }

    pub fn phase(&self) -> &PartitionPhase {
        &self.phase
    }

    /// Whether the export must capture a stream watermark first.
    ///
    /// True for every mode that streams, including `stream` partitions that
    /// were resynced back into an export.
    pub fn needs_watermark(&self) -> bool {
        self.mode.includes_stream()
    }

    /// `PendingExport → Exporting`
    pub fn begin_export(&mut self, watermark: Option<ResumeToken>) -> Result<&PartitionPhase> {
        if !matches!(self.phase, PartitionPhase::PendingExport) {
            return Err(self.illegal("begin export"));
        }
        let watermark = if self.needs_watermark() {
            match watermark {
                Some(w) => Some(w),
                None => return Err(self.illegal("begin export without a stream watermark")),
            }
        } else {
            None
        };
        self.phase = PartitionPhase::Exporting {
            cursor: None,
            watermark,
        };
        Ok(&self.phase)
    }

    /// Advance the export cursor.
    pub fn record_export_progress(&mut self, next: SnapshotCursor) -> Result<&PartitionPhase> {
        match &mut self.phase {
            PartitionPhase::Exporting { cursor, .. } => {
                *cursor = Some(next);
                Ok(&self.phase)
            }
            _ => Err(self.illegal("record export progress")),
        }
    }

    /// `Exporting → PendingStream` (or `Done` for export-only partitions)
    pub fn complete_export(&mut self) -> Result<&PartitionPhase> {
        let watermark = match &self.phase {
            PartitionPhase::Exporting { watermark, .. } => watermark.clone(),
            _ => return Err(self.illegal("complete export")),
        };
        self.phase = if self.mode.includes_stream() {
            PartitionPhase::PendingStream { start: watermark }
        } else {
            PartitionPhase::Done
        };
        Ok(&self.phase)
    }

    /// `PendingStream → Streaming`, starting at the export watermark
    pub fn begin_stream(&mut self) -> Result<&PartitionPhase> {
        match &self.phase {
            PartitionPhase::PendingStream { start } => {
                self.phase = PartitionPhase::Streaming {
                    token: start.clone(),
                };
                Ok(&self.phase)
            }
            _ => Err(self.illegal("begin stream")),
        }
    }

    /// Advance the stream resume token.
    pub fn record_stream_progress(&mut self, next: ResumeToken) -> Result<&PartitionPhase> {
        match &mut self.phase {
            PartitionPhase::Streaming { token } | PartitionPhase::StreamOnly { token } => {
                *token = Some(next);
                Ok(&self.phase)
            }
            _ => Err(self.illegal("record stream progress")),
        }
    }

    /// `Streaming | StreamOnly → PendingExport` after the stream history was lost
    pub fn resync(&mut self) -> Result<&PartitionPhase> {
        if !self.phase.is_streaming() {
            return Err(self.illegal("resync"));
        }
        self.phase = PartitionPhase::PendingExport;
        Ok(&self.phase)
    }

    /// Any live phase → `Done`
    pub fn decommission(&mut self) -> Result<&PartitionPhase> {
        if self.phase.is_terminal() {
            return Err(self.illegal("decommission"));
        }
        self.phase = PartitionPhase::Done;
        Ok(&self.phase)
    }

    fn illegal(&self, event: &'static str) -> IngestError {
        IngestError::InvalidStateTransition {
            partition: self.partition.clone(),
            from: self.phase.name().to_string(),
            event,
        }
    }
}
