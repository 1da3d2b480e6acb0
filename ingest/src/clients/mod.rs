//! Construction and memoization of warehouse clients.

mod cache;

use std::future::Future;
use std::time::Duration;

use config::shared::IngestConfig;
use gcp_bigquery_client::Client;
use gcp_bigquery_client::client_builder::ClientBuilder;
use tracing::info;

use crate::credentials::Credential;
use crate::encryption::install_crypto_provider;
use crate::error::IngestResult;
use crate::warehouse::{DEFAULT_POLL_INTERVAL, WriteClient};

pub use cache::ClientCache;

/// Builds the clients a [`ClientCache`] hands out.
///
/// Construction may perform network round trips (token exchange, discovery), which is why
/// the cache memoizes results.
pub trait ClientFactory: Send + Sync {
    /// Client for dataset, table and query operations.
    type WarehouseClient: Clone + Send + Sync;

    /// Client for streaming appends and load jobs.
    type WriteClient: Clone + Send + Sync;

    fn warehouse_client(
        &self,
        credential: &Credential,
        project_id: &str,
        location: &str,
    ) -> impl Future<Output = IngestResult<Self::WarehouseClient>> + Send;

    fn write_client(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = IngestResult<Self::WriteClient>> + Send;
}

/// [`ClientFactory`] producing BigQuery clients authenticated with a service account key.
#[derive(Debug, Clone, Copy)]
pub struct BigQueryClientFactory {
    load_job_poll_interval: Duration,
}

impl BigQueryClientFactory {
    pub fn new(load_job_poll_interval: Duration) -> Self {
        Self {
            load_job_poll_interval,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(Duration::from_millis(config.load_job_poll_interval_ms))
    }
}

impl Default for BigQueryClientFactory {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl ClientFactory for BigQueryClientFactory {
    type WarehouseClient = Client;
    type WriteClient = WriteClient;

    async fn warehouse_client(
        &self,
        credential: &Credential,
        project_id: &str,
        location: &str,
    ) -> IngestResult<Client> {
        install_crypto_provider();

        info!(
            identity = credential.identity(),
            %project_id,
            %location,
            "building bigquery client"
        );

        let client = ClientBuilder::new()
            .build_from_service_account_key(credential.key().clone(), false)
            .await?;

        Ok(client)
    }

    async fn write_client(&self, credential: &Credential) -> IngestResult<WriteClient> {
        install_crypto_provider();

        info!(identity = credential.identity(), "building bigquery write client");

        let client = WriteClient::from_service_account_key(credential.key().clone())
            .await?
            .with_poll_interval(self.load_job_poll_interval);

        Ok(client)
    }
}
