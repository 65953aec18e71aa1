//! Identifiers and position types shared across the crate

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Partition identifier in `container.leaf` form (e.g. `shop.orders`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Container scope (database/schema), the text before the first `.`
    pub fn container(&self) -> &str {
        self.0.split_once('.').map(|(c, _)| c).unwrap_or(&self.0)
    }

    /// Leaf scope (collection/table), everything after the first `.`
    pub fn leaf(&self) -> &str {
        self.0.split_once('.').map(|(_, l)| l).unwrap_or("")
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Worker instance identifier, recorded as the lease owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("worker-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which phases a partition runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IngestionMode {
    /// One-time bulk export, then done
    Export,
    /// Change stream only, starting at the current position
    Stream,
    /// Bulk export followed by the change stream from the export watermark
    #[default]
    #[serde(alias = "export_stream")]
    ExportThenStream,
}

impl IngestionMode {
    pub fn includes_export(&self) -> bool {
        matches!(self, Self::Export | Self::ExportThenStream)
    }

    pub fn includes_stream(&self) -> bool {
        matches!(self, Self::Stream | Self::ExportThenStream)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::Stream => "stream",
            Self::ExportThenStream => "export_then_stream",
        }
    }
}

impl std::fmt::Display for IngestionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IngestionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "export" => Ok(Self::Export),
            "stream" => Ok(Self::Stream),
            "export_then_stream" | "export_stream" => Ok(Self::ExportThenStream),
            other => Err(format!("unknown ingestion mode: {}", other)),
        }
    }
}

/// Opaque position inside a snapshot scan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotCursor(pub String);

impl SnapshotCursor {
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque position inside a change stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source-assigned record identifier (document `_id`, primary key)
pub type RecordId = String;
