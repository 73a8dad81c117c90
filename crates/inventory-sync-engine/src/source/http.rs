use std::time::Duration;

use async_trait::async_trait;
use inventory_sync_core::{BatchOp, Fields, RawRow, SourceAdapter, SyncError, WriteOutcome};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Retry-after assumed when a throttled response carries no usable header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Row service REST client.
///
/// Talks to a JSON front for the spreadsheet (an Apps Script web app or
/// similar) that exposes each sheet as a collection of rows keyed by their
/// identity column:
///
/// - `GET    {base}/sources/{source}/rows`        -> `{"rows": [{"id", "fields"}]}`
/// - `POST   {base}/sources/{source}/rows`        <- `{"id", "fields"}`
/// - `PUT    {base}/sources/{source}/rows/{id}`   <- `{"fields"}`
/// - `DELETE {base}/sources/{source}/rows/{id}`
/// - `POST   {base}/sources/{source}/rows:batch`  <- `{"ops"}` -> `{"results"}`
///
/// 429 and 503 mean the sheet is still propagating an earlier write.
pub struct HttpRowSource {
    http_client: HttpClient,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct RowsResponse {
    rows: Vec<RawRow>,
}

#[derive(Serialize)]
struct WriteBody<'a> {
    fields: &'a Fields,
}

#[derive(Serialize)]
struct InsertBody<'a> {
    id: &'a str,
    fields: &'a Fields,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    ops: &'a [BatchOp],
}

#[derive(Deserialize)]
struct BatchResponse {
    results: Vec<BatchResult>,
}

#[derive(Deserialize)]
struct BatchResult {
    status: u16,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retry_after_secs: Option<u64>,
}

impl HttpRowSource {
    /// Create a new client for the row service at `base_url`.
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }

    fn rows_url(&self, source: &str) -> String {
        format!(
            "{}/sources/{}/rows",
            self.base_url,
            urlencoding::encode(source)
        )
    }

    fn row_url(&self, source: &str, local_id: &str) -> String {
        format!(
            "{}/{}",
            self.rows_url(source),
            urlencoding::encode(local_id)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    fn retry_after(response: &Response) -> Duration {
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
    }

    fn is_throttled(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
    }

    /// Map a point-write response to an outcome.
    async fn outcome(response: Response) -> WriteOutcome {
        let status = response.status();
        if status.is_success() {
            return WriteOutcome::Ok;
        }
        if Self::is_throttled(status) {
            return WriteOutcome::RateLimited {
                retry_after: Self::retry_after(&response),
            };
        }
        if status == StatusCode::NOT_FOUND {
            return WriteOutcome::NotFound;
        }
        let text = response.text().await.unwrap_or_default();
        WriteOutcome::Failure(format!("status {}: {}", status, text))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> WriteOutcome {
        match self.authorize(request).send().await {
            Ok(response) => Self::outcome(response).await,
            Err(e) => WriteOutcome::Failure(format!("{} request failed: {}", what, e)),
        }
    }
}

#[async_trait]
impl SourceAdapter for HttpRowSource {
    fn backend_name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_all(&self, source: &str) -> Result<Vec<RawRow>, SyncError> {
        let response = self
            .authorize(self.http_client.get(self.rows_url(source)))
            .send()
            .await
            .map_err(|e| SyncError::Failure(format!("GET rows request failed: {}", e)))?;

        let status = response.status();
        if Self::is_throttled(status) {
            return Err(SyncError::RateLimited {
                retry_after: Self::retry_after(&response),
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(format!("source {}", source)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Failure(format!(
                "GET rows failed with status {}: {}",
                status, text
            )));
        }

        let body: RowsResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Failure(format!("Invalid rows response: {}", e)))?;

        debug!("GET rows of {} ({} rows)", source, body.rows.len());
        Ok(body.rows)
    }

    #[instrument(skip(self, fields), level = "debug", fields(field_count = fields.len()))]
    async fn write(&self, source: &str, local_id: &str, fields: &Fields) -> WriteOutcome {
        let request = self
            .http_client
            .put(self.row_url(source, local_id))
            .json(&WriteBody { fields });
        self.send(request, "PUT row").await
    }

    #[instrument(skip(self, fields), level = "debug", fields(field_count = fields.len()))]
    async fn insert(&self, source: &str, local_id: &str, fields: &Fields) -> WriteOutcome {
        let request = self
            .http_client
            .post(self.rows_url(source))
            .json(&InsertBody {
                id: local_id,
                fields,
            });
        self.send(request, "POST row").await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, source: &str, local_id: &str) -> WriteOutcome {
        let request = self.http_client.delete(self.row_url(source, local_id));
        self.send(request, "DELETE row").await
    }

    #[instrument(skip(self, ops), level = "debug", fields(op_count = ops.len()))]
    async fn batch_write(&self, source: &str, ops: &[BatchOp]) -> Vec<WriteOutcome> {
        let url = format!("{}:batch", self.rows_url(source));
        let sent = self
            .authorize(self.http_client.post(url))
            .json(&BatchBody { ops })
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                let reason = format!("batch request failed: {}", e);
                return vec![WriteOutcome::Failure(reason); ops.len()];
            }
        };

        // Whole-batch rejection applies to every op
        if !response.status().is_success() {
            let outcome = Self::outcome(response).await;
            return vec![outcome; ops.len()];
        }

        let body: BatchResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                let reason = format!("Invalid batch response: {}", e);
                return vec![WriteOutcome::Failure(reason); ops.len()];
            }
        };

        let mut results: Vec<WriteOutcome> = body
            .results
            .into_iter()
            .map(|r| match StatusCode::from_u16(r.status) {
                Ok(status) if status.is_success() => WriteOutcome::Ok,
                Ok(status) if Self::is_throttled(status) => WriteOutcome::RateLimited {
                    retry_after: r
                        .retry_after_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_RETRY_AFTER),
                },
                Ok(StatusCode::NOT_FOUND) => WriteOutcome::NotFound,
                _ => WriteOutcome::Failure(
                    r.error
                        .unwrap_or_else(|| format!("status {}", r.status)),
                ),
            })
            .collect();

        if results.len() > ops.len() {
            // Extra results cannot be matched to ops
            warn!(
                "Batch against {} returned {} results for {} ops",
                source,
                results.len(),
                ops.len()
            );
            let reason = format!(
                "batch returned {} results for {} ops",
                results.len(),
                ops.len()
            );
            return vec![WriteOutcome::Failure(reason); ops.len()];
        }
        if results.len() < ops.len() {
            warn!(
                "Batch against {} answered {} of {} ops",
                source,
                results.len(),
                ops.len()
            );
            results.resize(
                ops.len(),
                WriteOutcome::Failure("missing result in batch response".to_string()),
            );
        }
        debug!("Batch of {} ops against {}", ops.len(), source);
        results
    }
}
