use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required environment variable is not set.
    #[error("environment variable `{0}` must be set")]
    MissingEnvironmentVariable(&'static str),
    /// A warehouse identifier is empty.
    #[error("`{0}` cannot be empty")]
    EmptyIdentifier(&'static str),
    /// The streaming chunk size cannot be zero.
    #[error("`streaming_chunk_size` cannot be zero")]
    StreamingChunkSizeZero,
    /// The staging table expiration cannot be zero.
    #[error("`staging_expiration_secs` cannot be zero")]
    StagingExpirationZero,
}
