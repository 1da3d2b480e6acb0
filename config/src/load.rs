//! Layered configuration loading.
//!
//! A configuration root is merged from, in increasing precedence:
//!
//! 1. `base.(yaml|yml|json)`, which must exist;
//! 2. `{environment}.(yaml|yml|json)`, when present;
//! 3. `INGEST__`-prefixed environment variables, nested keys separated by `__`
//!    (`INGEST__WAREHOUSE__DATASET_ID`). Keys listed in [`Config::LIST_PARSE_KEYS`] accept
//!    comma-separated values.
//!
//! The merged root is validated before it is returned.

use std::io;
use std::path::{Path, PathBuf};

use rust_cli_config::{File, FileFormat, FileSourceFile};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::{Environment, UnknownEnvironment};
use crate::shared::ValidationError;

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV_NAME: &str = "INGEST_CONFIG_DIR";

/// Directory used when [`CONFIG_DIR_ENV_NAME`] is unset, relative to the working directory.
const DEFAULT_CONFIGURATION_DIR: &str = "configuration";

const BASE_FILE_STEM: &str = "base";

const FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

const ENV_PREFIX: &str = "INGEST";

/// Separates the prefix from the first key and nested keys from each other.
const ENV_KEY_SEPARATOR: &str = "__";

const LIST_SEPARATOR: &str = ",";

/// Configuration root loadable through [`load_config`].
pub trait Config {
    /// Dotted keys whose environment variable values are comma-separated lists.
    const LIST_PARSE_KEYS: &'static [&'static str];

    /// Checks invariants of the merged configuration.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Errors raised while locating, merging or validating configuration layers.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingDirectory(PathBuf),

    #[error("no base configuration in `{directory}`, expected one of: {expected}")]
    MissingBaseFile { directory: PathBuf, expected: String },

    #[error(transparent)]
    Environment(#[from] UnknownEnvironment),

    #[error("failed to merge configuration layers: {0}")]
    Merge(#[source] rust_cli_config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationError),
}

/// Loads `T` from the configuration directory for the current [`Environment`].
///
/// The directory is [`CONFIG_DIR_ENV_NAME`] when set, `./configuration` otherwise.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let directory = match std::env::var_os(CONFIG_DIR_ENV_NAME) {
        Some(directory) if !directory.is_empty() => PathBuf::from(directory),
        _ => std::env::current_dir()
            .map_err(LoadConfigError::CurrentDir)?
            .join(DEFAULT_CONFIGURATION_DIR),
    };
    let environment = Environment::load()?;

    load_config_from(&directory, environment)
}

/// Loads `T` from `directory` for `environment`.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingDirectory(directory.to_path_buf()));
    }

    let base = find_layer(directory, BASE_FILE_STEM).ok_or_else(|| {
        LoadConfigError::MissingBaseFile {
            directory: directory.to_path_buf(),
            expected: candidate_names(BASE_FILE_STEM).join(", "),
        }
    })?;

    let mut builder = rust_cli_config::Config::builder().add_source(layer(base));
    if let Some(overlay) = find_layer(directory, environment.as_str()) {
        builder = builder.add_source(layer(overlay));
    }
    builder = builder.add_source(environment_overrides::<T>());

    let config = builder
        .build()
        .map_err(LoadConfigError::Merge)?
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)?;
    config.validate()?;

    Ok(config)
}

fn layer(path: PathBuf) -> File<FileSourceFile, FileFormat> {
    File::from(path).required(true)
}

fn environment_overrides<T: Config>() -> rust_cli_config::Environment {
    let mut source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_KEY_SEPARATOR)
        .separator(ENV_KEY_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        source = source.try_parsing(true).list_separator(LIST_SEPARATOR);
        for key in T::LIST_PARSE_KEYS {
            source = source.with_list_parse_key(key);
        }
    }

    source
}

/// Returns the first existing `{stem}.{extension}` file in `directory`.
fn find_layer(directory: &Path, stem: &str) -> Option<PathBuf> {
    candidate_names(stem)
        .into_iter()
        .map(|name| directory.join(name))
        .find(|path| path.is_file())
}

fn candidate_names(stem: &str) -> Vec<String> {
    FILE_EXTENSIONS
        .iter()
        .map(|extension| format!("{stem}.{extension}"))
        .collect()
}
