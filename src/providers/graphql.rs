use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use super::retry::RetryPolicy;

/// Header carrying the API credential on every request.
const API_KEY_HEADER: &str = "digitransit-subscription-key";

#[derive(Debug, Error)]
pub enum QueryError {
    /// Client-side connectivity failure; the device looks offline
    #[error("No connection: {0}")]
    Offline(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Decoding error: {0}")]
    Decode(String),
}

impl QueryError {
    /// Short message suitable for direct display. The offline case gets a
    /// friendlier wording than generic API failures.
    pub fn user_message(&self) -> &'static str {
        match self {
            QueryError::Offline(_) => "You appear to be offline. Check your connection.",
            QueryError::Network(_) => "The transit service could not be reached.",
            QueryError::Api(_) => "The transit service returned an error.",
            QueryError::Decode(_) => "The transit service returned an unexpected response.",
        }
    }
}

/// One attempt's failure plus whether a further attempt makes sense.
#[derive(Debug)]
struct AttemptError {
    error: QueryError,
    retryable: bool,
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: Option<String>,
}

/// Client for the transit GraphQL API with local retry on transient
/// failures.
pub struct TransitQueryClient {
    client: Client,
    url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl TransitQueryClient {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, QueryError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| QueryError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute a GraphQL query and decode its `data` payload into `T`.
    ///
    /// Transport failures and retryable HTTP statuses are retried up to the
    /// policy's attempt cap; upstream error envelopes and payload shape
    /// mismatches fail immediately. Cancellation is drop-based: an aborted
    /// caller drops the future between awaits and no retry fires.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, QueryError> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let mut attempt: u32 = 0;

        loop {
            match self.attempt::<T>(&body).await {
                Ok(value) => return Ok(value),
                Err(AttemptError { error, retryable }) => {
                    attempt += 1;
                    if !retryable || attempt >= self.retry.max_attempts {
                        return Err(error);
                    }
                    let delay = self.retry.delay(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transit query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(&self, body: &Value) -> Result<T, AttemptError> {
        let response = match self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let retryable = self.retry.is_retryable(&e);
                let error = if e.is_connect() {
                    QueryError::Offline(e.to_string())
                } else {
                    QueryError::Network(e.to_string())
                };
                return Err(AttemptError { error, retryable });
            }
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(AttemptError {
                error: QueryError::Api(format!("HTTP error: {status}")),
                retryable: self.retry.is_retryable_status(status),
            });
        }

        let text = response.text().await.map_err(|e| AttemptError {
            error: QueryError::Network(format!("Failed to read body: {e}")),
            retryable: true,
        })?;

        decode_envelope(&text)
    }
}

/// Decode a GraphQL response body: surface the upstream `errors` array when
/// present, otherwise unwrap `data` into the typed payload.
fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<T, AttemptError> {
    let envelope: GraphQlEnvelope<T> = serde_json::from_str(body).map_err(|e| AttemptError {
        error: QueryError::Decode(e.to_string()),
        retryable: false,
    })?;

    if !envelope.errors.is_empty() {
        let joined = envelope
            .errors
            .iter()
            .map(|e| e.message.as_deref().unwrap_or("unknown error"))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(AttemptError {
            error: QueryError::Api(joined),
            retryable: false,
        });
    }

    envelope.data.ok_or_else(|| AttemptError {
        error: QueryError::Decode("response carried neither data nor errors".to_string()),
        retryable: false,
    })
}
