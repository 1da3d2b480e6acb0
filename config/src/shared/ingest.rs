use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::ValidationError;

/// Tuning knobs of the ingestion core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IngestConfig {
    /// Number of rows sent per streaming append.
    #[serde(default = "default_streaming_chunk_size")]
    pub streaming_chunk_size: usize,
    /// Expiration applied to staging tables created by upserts.
    #[serde(default = "default_staging_expiration_secs")]
    pub staging_expiration_secs: u64,
    /// Interval between load job status checks.
    #[serde(default = "default_load_job_poll_interval_ms")]
    pub load_job_poll_interval_ms: u64,
    /// Columns that schema inference always declares as `NULLABLE`.
    #[serde(default)]
    pub force_nullable_columns: Vec<String>,
}

impl IngestConfig {
    pub const DEFAULT_STREAMING_CHUNK_SIZE: usize = 500;
    pub const DEFAULT_STAGING_EXPIRATION_SECS: u64 = 3600;
    pub const DEFAULT_LOAD_JOB_POLL_INTERVAL_MS: u64 = 1000;

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.streaming_chunk_size == 0 {
            return Err(ValidationError::StreamingChunkSizeZero);
        }

        if self.staging_expiration_secs == 0 {
            return Err(ValidationError::StagingExpirationZero);
        }

        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            streaming_chunk_size: Self::DEFAULT_STREAMING_CHUNK_SIZE,
            staging_expiration_secs: Self::DEFAULT_STAGING_EXPIRATION_SECS,
            load_job_poll_interval_ms: Self::DEFAULT_LOAD_JOB_POLL_INTERVAL_MS,
            force_nullable_columns: Vec::new(),
        }
    }
}

impl Config for IngestConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["force_nullable_columns"];

    fn validate(&self) -> Result<(), ValidationError> {
        IngestConfig::validate(self)
    }
}

fn default_streaming_chunk_size() -> usize {
    IngestConfig::DEFAULT_STREAMING_CHUNK_SIZE
}

fn default_staging_expiration_secs() -> u64 {
    IngestConfig::DEFAULT_STAGING_EXPIRATION_SECS
}

fn default_load_job_poll_interval_ms() -> u64 {
    IngestConfig::DEFAULT_LOAD_JOB_POLL_INTERVAL_MS
}
