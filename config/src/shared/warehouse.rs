use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Environment variable selecting the default warehouse project.
pub const PROJECT_ID_ENV_NAME: &str = "BQ_PROJECT_ID";
/// Environment variable selecting the default warehouse dataset.
pub const DATASET_ID_ENV_NAME: &str = "BQ_DATASET_ID";
/// Environment variable selecting the dataset location.
pub const LOCATION_ENV_NAME: &str = "BQ_LOCATION";
/// Environment variable holding the service account key as a JSON blob.
pub const CREDENTIALS_ENV_NAME: &str = "CREDENTIALS";

/// Configuration of the target warehouse.
///
/// This intentionally does not implement `Serialize` so the service account key cannot be
/// leaked into serialized forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WarehouseConfig {
    /// Google Cloud project identifier.
    pub project_id: String,
    /// Dataset identifier tables are created in.
    pub dataset_id: String,
    /// Dataset location used for dataset creation and jobs.
    #[serde(default = "default_location")]
    pub location: String,
    /// Inline service account key (JSON).
    #[serde(default)]
    pub credentials: Option<SecretString>,
    /// Path to a service account key file.
    #[serde(default)]
    pub credentials_path: Option<String>,
}

impl WarehouseConfig {
    /// Location used when none is configured.
    pub const DEFAULT_LOCATION: &'static str = "asia-southeast1";

    /// Builds the configuration from `BQ_PROJECT_ID`, `BQ_DATASET_ID`, `BQ_LOCATION` and
    /// `CREDENTIALS`.
    pub fn from_env() -> Result<WarehouseConfig, ValidationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<WarehouseConfig, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_id = lookup(PROJECT_ID_ENV_NAME)
            .ok_or(ValidationError::MissingEnvironmentVariable(PROJECT_ID_ENV_NAME))?;
        let dataset_id = lookup(DATASET_ID_ENV_NAME)
            .ok_or(ValidationError::MissingEnvironmentVariable(DATASET_ID_ENV_NAME))?;
        let location = lookup(LOCATION_ENV_NAME)
            .filter(|location| !location.trim().is_empty())
            .unwrap_or_else(default_location);
        let credentials = lookup(CREDENTIALS_ENV_NAME)
            .filter(|credentials| !credentials.trim().is_empty())
            .map(SecretString::new);

        let config = WarehouseConfig {
            project_id,
            dataset_id,
            location,
            credentials,
            credentials_path: None,
        };
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.project_id.trim().is_empty() {
            return Err(ValidationError::EmptyIdentifier("project_id"));
        }

        if self.dataset_id.trim().is_empty() {
            return Err(ValidationError::EmptyIdentifier("dataset_id"));
        }

        Ok(())
    }
}

fn default_location() -> String {
    WarehouseConfig::DEFAULT_LOCATION.to_string()
}
