//! Error types and result definitions for ingestion operations.
//!
//! [`IngestError`] carries a classified [`ErrorKind`], a static description, optional dynamic
//! detail, an optional source error and the captured call site. Errors raised by several
//! independent operations can be aggregated into one value.
//!
//! The write transport reports failures through the structured [`WriteError`] instead, so
//! callers can inspect row-level diagnostics before deciding to fall back to a load job.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use gcp_bigquery_client::error::BQError;
use thiserror::Error;

/// Convenient result type for ingestion operations using [`IngestError`] as the error type.
pub type IngestResult<T> = Result<T, IngestError>;

/// Detailed payload stored for single [`IngestError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for ingestion operations.
#[derive(Debug, Clone)]
pub struct IngestError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors.
    Many {
        errors: Vec<IngestError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors that can occur while ingesting rows.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Credentials
    CredentialResolutionFailure,
    AuthenticationError,

    // Schema & table lifecycle
    SchemaRequired,
    DatasetAlreadyExists,
    TableAlreadyExists,
    TableMissing,
    InvalidIdentifier,

    // Write paths
    StreamingWriteFailure,
    LoadJobFailure,
    MergeFailure,
    StagingCleanupFailure,

    // Data
    InvalidData,

    // Configuration
    ConfigError,

    // IO & serialization
    IoError,
    SerializationError,
    DeserializationError,

    // Warehouse
    WarehouseConnectionFailed,
    WarehouseQueryFailed,
    WarehouseIoError,
    WarehouseError,

    Unknown,
}

impl IngestError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description of this error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors"),
        }
    }

    /// Returns the dynamic detail if available.
    ///
    /// For aggregated errors, returns the detail of the first error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward their first error as the source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        IngestError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for IngestError {
    fn eq(&self, other: &IngestError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_detail(payload.detail.as_deref(), f)?;
                write_backtrace(payload.backtrace.as_ref(), f)
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for IngestError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

fn write_backtrace(backtrace: &Backtrace, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let rendered = backtrace.to_string();
    if rendered.trim().is_empty() || rendered.contains("disabled backtrace") {
        return Ok(());
    }

    write!(f, "\n  Backtrace:")?;
    for line in rendered.lines() {
        write!(f, "\n    {line}")?;
    }

    Ok(())
}

fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(detail) = detail else {
        return Ok(());
    };

    if detail.trim().is_empty() {
        return write!(f, "\n  Detail: <empty>");
    }

    write!(f, "\n  Detail:")?;
    for line in detail.lines() {
        write!(f, "\n    {line}")?;
    }

    Ok(())
}

/// Creates an [`IngestError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for IngestError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> IngestError {
        IngestError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates an [`IngestError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for IngestError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> IngestError {
        IngestError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates a vector of errors.
///
/// A vector holding exactly one error yields that error unwrapped.
impl<E> From<Vec<E>> for IngestError
where
    E: Into<IngestError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> IngestError {
        let location = Location::caller();
        let mut errors: Vec<IngestError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        IngestError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for IngestError {
    #[track_caller]
    fn from(err: std::io::Error) -> IngestError {
        let detail = err.to_string();
        IngestError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<config::LoadConfigError> for IngestError {
    #[track_caller]
    fn from(err: config::LoadConfigError) -> IngestError {
        let detail = err.to_string();
        IngestError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration loading failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for IngestError {
    #[track_caller]
    fn from(err: serde_json::Error) -> IngestError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        IngestError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<reqwest::Error> for IngestError {
    #[track_caller]
    fn from(err: reqwest::Error) -> IngestError {
        let (kind, description) = if err.is_connect() || err.is_timeout() {
            (
                ErrorKind::WarehouseConnectionFailed,
                "Warehouse HTTP connection failed",
            )
        } else if err.is_decode() {
            (
                ErrorKind::DeserializationError,
                "Warehouse HTTP response could not be decoded",
            )
        } else if err.is_status() {
            (ErrorKind::WarehouseError, "Warehouse HTTP request rejected")
        } else {
            (ErrorKind::WarehouseIoError, "Warehouse HTTP request failed")
        };

        let detail = err.to_string();
        IngestError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts BigQuery client errors with classification.
///
/// `404` responses map to [`ErrorKind::TableMissing`] and `409` responses to
/// [`ErrorKind::TableAlreadyExists`] so callers can branch on existence races.
impl From<BQError> for IngestError {
    #[track_caller]
    fn from(err: BQError) -> IngestError {
        let (kind, description) = match &err {
            BQError::InvalidServiceAccountKey(_)
            | BQError::InvalidServiceAccountAuthenticator(_)
            | BQError::InvalidInstalledFlowAuthenticator(_)
            | BQError::InvalidApplicationDefaultCredentialsAuthenticator(_)
            | BQError::InvalidAuthorizedUserAuthenticator(_)
            | BQError::AuthError(_)
            | BQError::YupAuthError(_)
            | BQError::NoToken => (
                ErrorKind::AuthenticationError,
                "BigQuery authentication failed",
            ),
            BQError::RequestError(_) => (ErrorKind::WarehouseIoError, "BigQuery request failed"),
            BQError::ResponseError { error } => match error.error.code {
                404 => (ErrorKind::TableMissing, "BigQuery resource not found"),
                409 => (
                    ErrorKind::TableAlreadyExists,
                    "BigQuery resource already exists",
                ),
                _ => (ErrorKind::WarehouseQueryFailed, "BigQuery response error"),
            },
            BQError::SerializationError(_) => (
                ErrorKind::SerializationError,
                "BigQuery JSON serialization error",
            ),
            _ => (ErrorKind::WarehouseError, "BigQuery client error"),
        };

        IngestError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(err.to_string())),
            None,
        )
    }
}

/// Row-level diagnostic reported by the write transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Index of the rejected row within the rows submitted by one call.
    pub index: usize,
    pub message: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.index, self.message)
    }
}

/// Structured failure returned by a streaming append.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WriteError {
    pub message: String,
    pub row_errors: Vec<RowError>,
}

impl WriteError {
    /// Creates a request-level error without row diagnostics.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            row_errors: Vec::new(),
        }
    }

    /// Creates an error carrying row diagnostics.
    pub fn with_row_errors(message: impl Into<String>, row_errors: Vec<RowError>) -> Self {
        Self {
            message: message.into(),
            row_errors,
        }
    }

    /// Shifts row indexes by `offset`, turning chunk-relative indexes into call-relative ones.
    pub fn offset_rows(mut self, offset: usize) -> Self {
        for row_error in &mut self.row_errors {
            row_error.index += offset;
        }
        self
    }
}

impl From<IngestError> for WriteError {
    fn from(err: IngestError) -> Self {
        let message = match err.detail() {
            Some(detail) => format!("{}: {detail}", err.description()),
            None => err.description().to_string(),
        };

        WriteError::new(message)
    }
}

impl From<arrow::error::ArrowError> for WriteError {
    fn from(err: arrow::error::ArrowError) -> Self {
        WriteError::new(err.to_string())
    }
}

/// Converts a [`WriteError`] into an [`IngestError`] with [`ErrorKind::StreamingWriteFailure`].
impl From<WriteError> for IngestError {
    #[track_caller]
    fn from(err: WriteError) -> IngestError {
        let mut detail = err.message.clone();
        for row_error in &err.row_errors {
            detail.push('\n');
            detail.push_str(&row_error.to_string());
        }

        IngestError::from_components(
            ErrorKind::StreamingWriteFailure,
            Cow::Borrowed("Streaming append failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
