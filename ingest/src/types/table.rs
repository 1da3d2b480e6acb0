use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::schema::TableSchema;

/// Granularity of time-based partitioning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionGranularity {
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

impl PartitionGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionGranularity::Hour => "HOUR",
            PartitionGranularity::Day => "DAY",
            PartitionGranularity::Month => "MONTH",
            PartitionGranularity::Year => "YEAR",
        }
    }
}

/// Time partitioning hint applied when a table is created.
///
/// A `None` field partitions by ingestion time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePartitioning {
    pub field: Option<String>,
    #[serde(default)]
    pub granularity: PartitionGranularity,
}

/// Everything needed to create a table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSpec {
    pub schema: TableSchema,
    pub partitioning: Option<TimePartitioning>,
    pub clustering: Vec<String>,
    /// Instant after which the warehouse drops the table on its own.
    pub expiration: Option<SystemTime>,
}

impl TableSpec {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    pub fn with_partitioning(mut self, partitioning: Option<TimePartitioning>) -> Self {
        self.partitioning = partitioning;
        self
    }

    pub fn with_clustering(mut self, clustering: Vec<String>) -> Self {
        self.clustering = clustering;
        self
    }

    pub fn with_expiration(mut self, expiration: SystemTime) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// How a load job treats rows already stored in the destination table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteDisposition {
    #[default]
    #[serde(rename = "WRITE_APPEND")]
    Append,
    #[serde(rename = "WRITE_TRUNCATE")]
    Truncate,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Append => "WRITE_APPEND",
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options of a single load job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadJobConfig {
    pub write_disposition: WriteDisposition,
    pub ignore_unknown_values: bool,
    pub allow_quoted_newlines: bool,
}

impl LoadJobConfig {
    pub fn new(write_disposition: WriteDisposition) -> Self {
        Self {
            write_disposition,
            ..Self::default()
        }
    }
}

impl Default for LoadJobConfig {
    fn default() -> Self {
        Self {
            write_disposition: WriteDisposition::Append,
            ignore_unknown_values: true,
            allow_quoted_newlines: true,
        }
    }
}

/// Rows returned by a pass-through query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    /// Number of rows touched by a DML statement.
    pub affected_rows: Option<u64>,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    pub total_rows: u64,
    pub affected_rows: u64,
}

/// Outcome of [`crate::ingestor::Ingestor::insert_rows`].
///
/// Handled fallbacks are reported here rather than raised: `error` then holds the streaming
/// failure that triggered the load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionResult {
    pub streamed_ok: bool,
    pub fallback_used: bool,
    pub error: Option<String>,
    /// Set when rows were upserted instead of appended.
    pub upsert: Option<UpsertResult>,
}

impl IngestionResult {
    pub(crate) fn streamed() -> Self {
        Self {
            streamed_ok: true,
            fallback_used: false,
            error: None,
            upsert: None,
        }
    }

    pub(crate) fn fell_back(error: String) -> Self {
        Self {
            streamed_ok: false,
            fallback_used: true,
            error: Some(error),
            upsert: None,
        }
    }

    pub(crate) fn upserted(upsert: UpsertResult) -> Self {
        Self {
            streamed_ok: false,
            fallback_used: false,
            error: None,
            upsert: Some(upsert),
        }
    }
}
