//! JSON-over-HTTP calls with retry for the embedding and generation
//! providers.
//!
//! - HTTP 429 and 5xx: retry
//! - other 4xx: fail immediately
//! - network errors: retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// A provider endpoint: where to POST and how to authenticate.
pub struct Endpoint<'a> {
    /// Shown in errors and logs, e.g. `"OpenAI"`.
    pub service: &'a str,
    pub url: String,
    pub bearer: Option<String>,
}

pub fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// POST `body` and return the parsed JSON response, retrying transient
/// failures up to `max_retries` times.
pub async fn post_json(
    client: &reqwest::Client,
    endpoint: &Endpoint<'_>,
    body: &Value,
    max_retries: u32,
) -> Result<Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff(attempt)).await;
        }

        let mut request = client.post(&endpoint.url).json(body);
        if let Some(token) = &endpoint.bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if is_retryable(status) {
                    warn!(service = endpoint.service, %status, attempt, "retryable API error");
                    last_err = Some(anyhow!(
                        "{} API error {}: {}",
                        endpoint.service,
                        status,
                        body_text
                    ));
                    continue;
                }
                bail!("{} API error {}: {}", endpoint.service, status, body_text);
            }
            Err(e) => {
                warn!(service = endpoint.service, url = %endpoint.url, attempt, error = %e, "request failed");
                last_err = Some(anyhow!(
                    "{} connection error ({}): {}",
                    endpoint.service,
                    endpoint.url,
                    e
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", endpoint.service)))
}
