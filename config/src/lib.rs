//! Configuration shared by the warehouse ingestion crates.
//!
//! [`load_config`] merges the [`shared::IngestSettings`] root from a base file, an optional
//! environment overlay and `INGEST__` environment variables.

pub mod environment;
pub mod load;
pub mod shared;

pub use environment::{Environment, UnknownEnvironment};
pub use load::{Config, LoadConfigError, load_config, load_config_from};
