//! Source configuration
//!
//! Loaded from YAML:
//!
//! ```yaml
//! ingestion_mode: export_then_stream
//! acknowledgments: true
//! collections:
//!   - collection: shop.orders
//!   - collection: shop.audit
//!     ingestion_mode: stream
//! lease:
//!   duration_ms: 30000
//!   renew_interval_ms: 10000
//! store:
//!   type: file
//!   path: /var/lib/rivven/ingest
//! ```
//!
//! Every section except `collections` has defaults.

use crate::error::{IngestError, Result};
use crate::resilience::RetryConfig;
use crate::store::{FileStateStore, MemoryStateStore, SharedStateStore};
use crate::types::IngestionMode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

fn default_true() -> bool {
    true
}

/// Top-level source configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct SourceConfig {
    /// Collections to ingest, as `database.collection`
    pub collections: Vec<CollectionConfig>,

    /// Mode for collections that do not set their own
    #[serde(default)]
    pub ingestion_mode: IngestionMode,

    /// Gate checkpoints on downstream acknowledgements
    #[serde(default = "default_true")]
    pub acknowledgments: bool,

    #[serde(default)]
    #[validate(nested)]
    pub lease: LeaseConfig,

    #[serde(default)]
    #[validate(nested)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    #[validate(nested)]
    pub ack: AckConfig,

    #[serde(default)]
    #[validate(nested)]
    pub snapshot: SnapshotSettings,

    #[serde(default)]
    #[validate(nested)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub store: StoreConfig,
}

impl SourceConfig {
    /// Config for the given collections with every other section defaulted.
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: collections.into_iter().map(CollectionConfig::new).collect(),
            ingestion_mode: IngestionMode::default(),
            acknowledgments: true,
            lease: LeaseConfig::default(),
            acquisition: AcquisitionConfig::default(),
            ack: AckConfig::default(),
            snapshot: SnapshotSettings::default(),
            stream: StreamSettings::default(),
            store: StoreConfig::default(),
        }
    }

    pub fn with_ingestion_mode(mut self, mode: IngestionMode) -> Self {
        self.ingestion_mode = mode;
        self
    }

    pub fn with_acknowledgments(mut self, enabled: bool) -> Self {
        self.acknowledgments = enabled;
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            IngestError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Range checks and cross-field constraints.
    ///
    /// Collection names are checked separately by
    /// [`CollectionValidator`](crate::validation::CollectionValidator).
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| IngestError::config(e.to_string()))?;

        if self.lease.renew_interval_ms >= self.lease.duration_ms {
            return Err(IngestError::config(format!(
                "lease.renew_interval_ms ({}) must be less than lease.duration_ms ({})",
                self.lease.renew_interval_ms, self.lease.duration_ms
            )));
        }
        if self.acquisition.interval_ms > self.acquisition.max_interval_ms {
            return Err(IngestError::config(
                "acquisition.interval_ms must not exceed acquisition.max_interval_ms",
            ));
        }
        Ok(())
    }

    /// JSON schema of the configuration file
    pub fn schema_json() -> serde_json::Value {
        let schema = schemars::schema_for!(SourceConfig);
        serde_json::to_value(schema).unwrap_or_default()
    }

    /// Effective mode of one collection.
    pub fn mode_for(&self, collection: &CollectionConfig) -> IngestionMode {
        collection.ingestion_mode.unwrap_or(self.ingestion_mode)
    }
}

/// One configured collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CollectionConfig {
    /// `database.collection`
    pub collection: String,
    /// Overrides the source-level mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_mode: Option<IngestionMode>,
}

impl CollectionConfig {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ingestion_mode: None,
        }
    }

    pub fn with_mode(mut self, mode: IngestionMode) -> Self {
        self.ingestion_mode = Some(mode);
        self
    }
}

/// Partition lease timing.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease lifetime without renewal
    #[validate(range(min = 100, max = 86_400_000))]
    pub duration_ms: u64,
    /// Renewal period; must be well under `duration_ms`
    #[validate(range(min = 10, max = 3_600_000))]
    pub renew_interval_ms: u64,
    /// Re-read and retry budget for conflicting writes by the same owner
    #[validate(range(min = 1, max = 100))]
    pub max_conflict_retries: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: 30_000,
            renew_interval_ms: 10_000,
            max_conflict_retries: 5,
        }
    }
}

impl LeaseConfig {
    /// Lease of `duration` renewed three times per lifetime.
    pub fn with_duration(duration: Duration) -> Self {
        let duration_ms = duration.as_millis() as u64;
        Self {
            duration_ms,
            renew_interval_ms: (duration_ms / 3).max(1),
            ..Default::default()
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

/// Partition acquisition loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Initial wait after finding nothing to claim
    #[validate(range(min = 1, max = 3_600_000))]
    pub interval_ms: u64,
    /// Backoff cap
    #[validate(range(min = 1, max = 3_600_000))]
    pub max_interval_ms: u64,
    /// Partitions one worker may own at once
    #[validate(range(min = 1, max = 10_000))]
    pub max_partitions: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_interval_ms: 30_000,
            max_partitions: 4,
        }
    }
}

impl AcquisitionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Acknowledgement tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(default)]
pub struct AckConfig {
    /// A batch not acknowledged within this window is redelivered
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
    /// How often the timeout is checked
    #[validate(range(min = 1, max = 600_000))]
    pub check_interval_ms: u64,
    /// Unacknowledged batches allowed per partition before reads pause
    #[validate(range(min = 1, max = 100_000))]
    pub max_in_flight_batches: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            check_interval_ms: 1_000,
            max_in_flight_batches: 16,
        }
    }
}

impl AckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Snapshot (export) settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(default)]
pub struct SnapshotSettings {
    /// Records per page
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: usize,
    #[validate(range(max = 100))]
    pub max_retries: u32,
    #[validate(range(min = 1))]
    pub retry_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_retry_delay_ms: u64,
    /// Spread applied to each retry delay (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    pub retry_jitter: f64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_retries: 5,
            retry_delay_ms: 200,
            max_retry_delay_ms: 10_000,
            retry_jitter: 0.25,
        }
    }
}

impl SnapshotSettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(self.max_retries)
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
            .max_delay(Duration::from_millis(self.max_retry_delay_ms))
            .jitter(self.retry_jitter)
            .build()
    }
}

/// Change stream settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(default)]
pub struct StreamSettings {
    /// Maximum events per batch
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: usize,
    /// Consecutive reopen failures tolerated
    #[validate(range(max = 1_000))]
    pub max_retries: u32,
    #[validate(range(min = 1))]
    pub retry_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_retry_delay_ms: u64,
    /// Spread applied to each retry delay (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    pub retry_jitter: f64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 10,
            retry_delay_ms: 200,
            max_retry_delay_ms: 10_000,
            retry_jitter: 0.25,
        }
    }
}

impl StreamSettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(self.max_retries)
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
            .max_delay(Duration::from_millis(self.max_retry_delay_ms))
            .jitter(self.retry_jitter)
            .build()
    }
}

/// Where partition state lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
        #[serde(default = "default_true")]
        fsync: bool,
    },
}

impl StoreConfig {
    pub async fn open(&self) -> Result<SharedStateStore> {
        Ok(match self {
            Self::Memory => Arc::new(MemoryStateStore::new()),
            Self::File { path, fsync } => {
                Arc::new(FileStateStore::with_options(path, *fsync).await?)
            }
        })
    }
}
