//! Deployment environment selecting the configuration overlay.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Environment variable naming the deployment environment.
pub const ENVIRONMENT_ENV_NAME: &str = "INGEST_ENVIRONMENT";

/// Deployment an ingestion process runs in.
///
/// Its name is the stem of the optional overlay file layered on top of `base`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Dev,
    /// Pre-production deployments writing to scratch datasets.
    Staging,
    Prod,
}

/// Returned for environment names other than `dev`, `staging` and `prod`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown environment `{0}`, expected `dev`, `staging` or `prod`")]
pub struct UnknownEnvironment(pub String);

impl Environment {
    const ALL: [Environment; 3] = [Environment::Dev, Environment::Staging, Environment::Prod];

    /// Reads [`ENVIRONMENT_ENV_NAME`], defaulting to [`Environment::Dev`] when unset or blank.
    pub fn load() -> Result<Environment, UnknownEnvironment> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Environment::load`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Environment, UnknownEnvironment>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(ENVIRONMENT_ENV_NAME) {
            Some(name) if !name.trim().is_empty() => name.parse(),
            _ => Ok(Environment::default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    pub fn is_prod(&self) -> bool {
        *self == Environment::Prod
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    /// Matches names case-insensitively, ignoring surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();

        Self::ALL
            .into_iter()
            .find(|environment| environment.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownEnvironment(name.to_string()))
    }
}
