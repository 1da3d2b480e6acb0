use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::yup_oauth2::{ServiceAccountAuthenticator, ServiceAccountKey};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::types::{LoadJobConfig, TableSchema};

const API_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_BASE_URL: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
const BIGQUERY_SCOPES: &[&str] = &["https://www.googleapis.com/auth/bigquery"];
const MULTIPART_BOUNDARY: &str = "ingest_load_job_boundary";

/// Default delay between two load job status checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

type TokenFuture = Pin<Box<dyn Future<Output = IngestResult<String>> + Send>>;

/// Source of OAuth2 bearer tokens for the load job endpoints.
#[derive(Clone)]
pub struct TokenSource {
    fetch: Arc<dyn Fn() -> TokenFuture + Send + Sync>,
}

impl TokenSource {
    /// Creates a token source from an async closure.
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IngestResult<String>> + Send + 'static,
    {
        Self {
            fetch: Arc::new(move || Box::pin(fetch())),
        }
    }

    /// A source always returning `token`.
    pub fn fixed(token: SecretString) -> Self {
        Self::new(move || {
            let token = token.expose_secret().clone();
            async move { Ok(token) }
        })
    }

    /// A source minting tokens for a service account, refreshing them when they expire.
    pub async fn service_account(key: ServiceAccountKey) -> IngestResult<Self> {
        let authenticator = ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|err| {
                ingest_error!(
                    ErrorKind::AuthenticationError,
                    "Service account authenticator could not be built",
                    err.to_string(),
                    source: err
                )
            })?;
        let authenticator = Arc::new(authenticator);

        Ok(Self::new(move || {
            let authenticator = Arc::clone(&authenticator);
            async move {
                let token = authenticator
                    .token(BIGQUERY_SCOPES)
                    .await
                    .map_err(BQError::from)?;

                match token.token() {
                    Some(token) => Ok(token.to_string()),
                    None => bail!(
                        ErrorKind::AuthenticationError,
                        "Service account token response holds no access token"
                    ),
                }
            }
        }))
    }

    async fn token(&self) -> IngestResult<String> {
        (self.fetch)().await
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSource")
    }
}

/// HTTP client for the load job endpoints.
///
/// One client is shared by every caller using the same service account.
#[derive(Debug, Clone)]
pub struct WriteClient {
    http: reqwest::Client,
    token_source: TokenSource,
    identity: String,
    poll_interval: Duration,
}

impl WriteClient {
    pub fn new(identity: impl Into<String>, token_source: TokenSource) -> IngestResult<Self> {
        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            http,
            token_source,
            identity: identity.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Creates a client authenticating as the service account of `key`.
    pub async fn from_service_account_key(key: ServiceAccountKey) -> IngestResult<Self> {
        let identity = key.client_email.clone();
        let token_source = TokenSource::service_account(key).await?;

        Self::new(identity, token_source)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Service account the client authenticates as.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Uploads newline-delimited JSON rows as a load job and waits for it to complete.
    ///
    /// Returns the number of rows the job reports as loaded.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_load_job(
        &self,
        project_id: &str,
        dataset_id: &str,
        table_id: &str,
        location: &str,
        schema: &TableSchema,
        ndjson: String,
        config: &LoadJobConfig,
    ) -> IngestResult<u64> {
        let job_id = format!("ingest_load_{}", uuid::Uuid::new_v4().simple());
        let metadata = load_job_metadata(
            project_id, dataset_id, table_id, location, &job_id, schema, config,
        )?;
        let body = multipart_body(MULTIPART_BOUNDARY, &metadata, &ndjson);

        let url = format!("{UPLOAD_BASE_URL}/projects/{project_id}/jobs?uploadType=multipart");
        let token = self.token_source.token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let mut job: Value = response.json().await?;
        if !status.is_success() {
            bail!(
                ErrorKind::LoadJobFailure,
                "Load job submission rejected",
                format!("status {status}: {}", error_message(&job))
            );
        }

        info!(%job_id, table = table_id, "submitted load job");

        loop {
            if let Some(outcome) = job_outcome(&job) {
                return outcome;
            }

            debug!(%job_id, "load job still running");
            tokio::time::sleep(self.poll_interval).await;

            let url = format!("{API_BASE_URL}/projects/{project_id}/jobs/{job_id}");
            let token = self.token_source.token().await?;
            let response = self
                .http
                .get(&url)
                .bearer_auth(token)
                .query(&[("location", location)])
                .send()
                .await?;

            let status = response.status();
            job = response.json().await?;
            if !status.is_success() {
                bail!(
                    ErrorKind::LoadJobFailure,
                    "Load job status could not be read",
                    format!("status {status}: {}", error_message(&job))
                );
            }
        }
    }
}

/// Builds the job resource describing a load of newline-delimited JSON.
fn load_job_metadata(
    project_id: &str,
    dataset_id: &str,
    table_id: &str,
    location: &str,
    job_id: &str,
    schema: &TableSchema,
    config: &LoadJobConfig,
) -> IngestResult<Value> {
    Ok(json!({
        "jobReference": {
            "projectId": project_id,
            "jobId": job_id,
            "location": location,
        },
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": project_id,
                    "datasetId": dataset_id,
                    "tableId": table_id,
                },
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "schema": serde_json::to_value(schema)?,
                "writeDisposition": config.write_disposition.as_str(),
                "createDisposition": "CREATE_IF_NEEDED",
                "ignoreUnknownValues": config.ignore_unknown_values,
                "allowQuotedNewlines": config.allow_quoted_newlines,
            }
        }
    }))
}

fn multipart_body(boundary: &str, metadata: &Value, data: &str) -> Vec<u8> {
    format!(
        "--{boundary}\r\n\
         Content-Type: application/json; charset=UTF-8\r\n\r\n\
         {metadata}\r\n\
         --{boundary}\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         {data}\r\n\
         --{boundary}--\r\n"
    )
    .into_bytes()
}

/// Returns the outcome of a finished job, or `None` while it is still running.
fn job_outcome(job: &Value) -> Option<IngestResult<u64>> {
    let status = job.get("status")?;
    if status.get("state").and_then(Value::as_str) != Some("DONE") {
        return None;
    }

    if let Some(error) = status.get("errorResult") {
        let details = status
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .map(error_message)
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();

        return Some(Err(ingest_error!(
            ErrorKind::LoadJobFailure,
            "Load job failed",
            format!("{} {details}", error_message(error)).trim_end().to_string()
        )));
    }

    let output_rows = job
        .pointer("/statistics/load/outputRows")
        .and_then(|rows| match rows {
            Value::String(rows) => rows.parse().ok(),
            other => other.as_u64(),
        })
        .unwrap_or_default();

    Some(Ok(output_rows))
}

/// Human readable message of an error proto or an error response body.
fn error_message(error: &Value) -> String {
    let error = error.get("error").unwrap_or(error);

    let message = error.get("message").and_then(Value::as_str).unwrap_or("");
    match error.get("location").and_then(Value::as_str) {
        Some(location) if !location.is_empty() => format!("{location}: {message}"),
        _ => message.to_string(),
    }
}
