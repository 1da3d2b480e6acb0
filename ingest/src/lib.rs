//! Ingestion of loosely typed row batches into BigQuery tables.
//!
//! Rows are normalized against the strict table schema, then written through the streaming
//! path with a single load job as fallback, or upserted through a staging table and a
//! `MERGE`. The [`ingestor::Ingestor`] ties these steps together on top of any
//! [`warehouse::Warehouse`].

pub mod clients;
pub mod credentials;
pub mod decoding;
pub mod encoding;
pub mod encryption;
pub mod error;
pub mod ingestor;
pub mod json;
pub mod load;
mod macros;
pub mod merge;
pub mod metrics;
pub mod normalize;
pub mod streaming;
pub mod table;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod warehouse;
