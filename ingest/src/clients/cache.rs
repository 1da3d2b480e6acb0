use std::collections::HashMap;

use config::shared::WarehouseConfig;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clients::{BigQueryClientFactory, ClientFactory};
use crate::credentials::Credential;
use crate::error::IngestResult;
use crate::warehouse::BigQueryWarehouse;

struct CacheState<W, C> {
    /// Warehouse clients keyed by `(project, location)`.
    warehouse_clients: HashMap<(String, String), W>,
    /// Write clients keyed by credential identity.
    write_clients: HashMap<String, C>,
}

/// Memoizes clients built by a [`ClientFactory`].
///
/// One mutex guards lookup and construction together, so concurrent first uses of the same
/// key build a single client. The cache is meant to be created once by the application and
/// shared, typically behind an [`std::sync::Arc`].
pub struct ClientCache<F: ClientFactory> {
    factory: F,
    state: Mutex<CacheState<F::WarehouseClient, F::WriteClient>>,
}

impl<F: ClientFactory> ClientCache<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            state: Mutex::new(CacheState {
                warehouse_clients: HashMap::new(),
                write_clients: HashMap::new(),
            }),
        }
    }

    /// Returns the warehouse client for `(project_id, location)`, building it on first use.
    pub async fn warehouse_client(
        &self,
        credential: &Credential,
        project_id: &str,
        location: &str,
    ) -> IngestResult<F::WarehouseClient> {
        let mut state = self.state.lock().await;

        let key = (project_id.to_string(), location.to_string());
        if let Some(client) = state.warehouse_clients.get(&key) {
            return Ok(client.clone());
        }

        debug!(%project_id, %location, "warehouse client cache miss");
        let client = self
            .factory
            .warehouse_client(credential, project_id, location)
            .await?;
        state.warehouse_clients.insert(key, client.clone());

        Ok(client)
    }

    /// Returns the write client for the identity of `credential`, building it on first use.
    pub async fn write_client(&self, credential: &Credential) -> IngestResult<F::WriteClient> {
        let mut state = self.state.lock().await;

        if let Some(client) = state.write_clients.get(credential.identity()) {
            return Ok(client.clone());
        }

        debug!(identity = credential.identity(), "write client cache miss");
        let client = self.factory.write_client(credential).await?;
        state
            .write_clients
            .insert(credential.identity().to_string(), client.clone());

        Ok(client)
    }

    /// Drops every cached client.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.warehouse_clients.clear();
        state.write_clients.clear();
    }
}

impl<F: ClientFactory + Default> Default for ClientCache<F> {
    fn default() -> Self {
        Self::new(F::default())
    }
}

impl ClientCache<BigQueryClientFactory> {
    /// Returns a [`BigQueryWarehouse`] for `config`, reusing cached clients.
    pub async fn warehouse(
        &self,
        credential: &Credential,
        config: &WarehouseConfig,
    ) -> IngestResult<BigQueryWarehouse> {
        let client = self
            .warehouse_client(credential, &config.project_id, &config.location)
            .await?;
        let write_client = self.write_client(credential).await?;

        Ok(BigQueryWarehouse::new(
            client,
            write_client,
            &config.project_id,
            &config.dataset_id,
            &config.location,
        ))
    }
}
