//! Startup validation of configured collections
//!
//! Runs before any coordination or I/O. Every failure here is fatal.

use crate::config::SourceConfig;
use crate::error::{IngestError, Result};
use crate::mode::{IngestionModeController, PartitionPhase};
use crate::types::{IngestionMode, PartitionKey};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Maximum partition identifier length in bytes
const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Separator between container and leaf scope
pub const PARTITION_SEPARATOR: char = '.';

/// Segments may not contain whitespace, NUL or path separators
static SEGMENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s\x00/\\]+$").expect("static regex"));

/// A validated collection ready for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub partition: PartitionKey,
    pub mode: IngestionMode,
    pub initial_phase: PartitionPhase,
}

/// Validator for configured collections
pub struct CollectionValidator;

impl CollectionValidator {
    /// Validate one identifier of the form `container.leaf`.
    ///
    /// The leaf may itself contain dots (`shop.orders.archive`).
    pub fn validate_partition_identifier(identifier: &str) -> Result<PartitionKey> {
        if identifier.is_empty() {
            return Err(IngestError::invalid_identifier(
                identifier,
                "identifier cannot be empty",
            ));
        }

        if identifier.len() > MAX_IDENTIFIER_LENGTH {
            return Err(IngestError::invalid_identifier(
                identifier,
                format!(
                    "identifier too long: {} bytes (max: {})",
                    identifier.len(),
                    MAX_IDENTIFIER_LENGTH
                ),
            ));
        }

        let segments: Vec<&str> = identifier.split(PARTITION_SEPARATOR).collect();
        if segments.len() < 2 {
            return Err(IngestError::invalid_identifier(
                identifier,
                "must be in database.collection format",
            ));
        }

        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(IngestError::invalid_identifier(
                    identifier,
                    format!("segment {} is empty", index + 1),
                ));
            }
            if !SEGMENT_REGEX.is_match(segment) {
                return Err(IngestError::invalid_identifier(
                    identifier,
                    format!(
                        "segment '{}' contains whitespace, NUL or path separators",
                        segment
                    ),
                ));
            }
        }

        Ok(PartitionKey::new(identifier))
    }

    /// Validate every configured collection and derive its initial phase.
    pub fn validate(config: &SourceConfig) -> Result<Vec<CollectionSpec>> {
        if config.collections.is_empty() {
            return Err(IngestError::config("at least one collection is required"));
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(config.collections.len());

        for collection in &config.collections {
            let partition = Self::validate_partition_identifier(&collection.collection)?;
            if !seen.insert(partition.clone()) {
                return Err(IngestError::invalid_identifier(
                    &collection.collection,
                    "collection is configured more than once",
                ));
            }

            let mode = config.mode_for(collection);
            specs.push(CollectionSpec {
                partition,
                mode,
                initial_phase: IngestionModeController::initial_phase(mode),
            });
        }

        Ok(specs)
    }
}
