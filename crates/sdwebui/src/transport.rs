//! Retrying HTTP transport for the generation backend.
//!
//! [`ResilientClient`] wraps a shared [`reqwest::Client`] and applies a
//! bounded retry budget with exponential backoff to every call. Transient
//! failures (connection errors, timeouts, 5xx) are retried; 4xx responses
//! are application errors and surface immediately.
//!
//! Two policies are configured: [`CallKind::Check`] for short, frequent
//! status calls and [`CallKind::Post`] for long generation calls.

use std::time::Duration;

use serde_json::Value;

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Timeout and retry budget for one class of backend call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Base of the backoff, in seconds. Retry `n` sleeps
    /// `backoff_factor * 2^(n-1)` seconds.
    pub backoff_factor: f64,
    /// Per-attempt request timeout.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff_factor: f64, timeout: Duration) -> Self {
        Self {
            retries,
            backoff_factor,
            timeout,
        }
    }

    /// Sleep before retry number `retry` (1-based), clamped to [`MAX_BACKOFF`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 || self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(31) as i32;
        let secs = self.backoff_factor * 2f64.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Total attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Which retry policy a call uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Check,
    Post,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the transport after its retry budget is applied.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The backend answered with a 4xx (or other non-retryable) status.
    #[error("Backend rejected {url} ({status}): {body}")]
    Application {
        url: String,
        status: u16,
        body: String,
    },

    /// Every attempt failed transiently.
    #[error("Backend call to {url} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    /// The request could not be built (e.g. invalid URL).
    #[error("Invalid request to {url}: {source}")]
    InvalidRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered 2xx with a body that is not JSON.
    #[error("Invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// The underlying HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl TransportError {
    /// HTTP status of an application error, if that is what this is.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Application { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Outcome of a single failed attempt.
enum AttemptError {
    Transient(String),
    Fatal(TransportError),
}

// ---------------------------------------------------------------------------
// ResilientClient
// ---------------------------------------------------------------------------

/// Shared, cheaply clonable HTTP client for one backend instance.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: reqwest::Client,
    base_url: String,
    check: RetryPolicy,
    post: RetryPolicy,
}

impl ResilientClient {
    /// Create a client with its own connection pool.
    ///
    /// * `base_url` - backend root, e.g. `http://localhost:7860`.
    pub fn new(
        base_url: impl Into<String>,
        check: RetryPolicy,
        post: RetryPolicy,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_client(http, base_url, check, post))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        check: RetryPolicy,
        post: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            check,
            post,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn policy(&self, kind: CallKind) -> &RetryPolicy {
        match kind {
            CallKind::Check => &self.check,
            CallKind::Post => &self.post,
        }
    }

    /// Join a backend-relative endpoint against the base URL.
    ///
    /// Absolute URLs are returned unchanged.
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    /// POST a JSON body and return the decoded JSON response.
    ///
    /// An empty 2xx body decodes as `null`.
    pub async fn post_json(
        &self,
        endpoint: &str,
        body: &Value,
        kind: CallKind,
    ) -> Result<Value, TransportError> {
        let url = self.url(endpoint);
        let policy = *self.policy(kind);
        self.execute(&url, &policy, || self.http.post(&url).json(body))
            .await
    }

    /// GET a JSON resource.
    pub async fn get_json(&self, endpoint: &str, kind: CallKind) -> Result<Value, TransportError> {
        let url = self.url(endpoint);
        let policy = *self.policy(kind);
        self.execute(&url, &policy, || self.http.get(&url)).await
    }

    // ---- private helpers ----

    /// Run attempts until one succeeds, a fatal error occurs, or the
    /// policy's budget is spent.
    async fn execute<F>(
        &self,
        url: &str,
        policy: &RetryPolicy,
        build: F,
    ) -> Result<Value, TransportError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let max_attempts = policy.max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match Self::attempt(url, build().timeout(policy.timeout)).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => e,
            };

            if attempt >= max_attempts {
                tracing::error!(
                    url,
                    attempts = attempt,
                    error = %error,
                    "Backend retries exhausted",
                );
                return Err(TransportError::Exhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = policy.delay_for(attempt);
            tracing::warn!(
                url,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient backend failure, retrying",
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One request/response exchange, classified for the retry loop.
    async fn attempt(url: &str, request: reqwest::RequestBuilder) -> Result<Value, AttemptError> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(AttemptError::Fatal(TransportError::InvalidRequest {
                    url: url.to_string(),
                    source: e,
                }))
            }
            Err(e) => return Err(AttemptError::Transient(e.to_string())),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Err(AttemptError::Transient(format!("reading body: {e}"))),
        };

        if status.is_server_error() {
            return Err(AttemptError::Transient(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_body(&text)
            )));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(TransportError::Application {
                url: url.to_string(),
                status: status.as_u16(),
                body: truncate_body(&text),
            }));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|source| {
            AttemptError::Fatal(TransportError::Decode {
                url: url.to_string(),
                source,
            })
        })
    }
}

/// Keep error bodies short; backends echo whole payloads on failure.
fn truncate_body(text: &str) -> String {
    const MAX_CHARS: usize = 512;
    if text.chars().count() <= MAX_CHARS {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX_CHARS).collect();
        format!("{head}...")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff_factor: f64) -> RetryPolicy {
        RetryPolicy::new(5, backoff_factor, Duration::from_secs(10))
    }

    #[test]
    fn delay_doubles_per_retry() {
        let p = policy(1.0);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn fractional_factor() {
        let p = policy(0.5);
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(4), Duration::from_secs(4));
    }

    #[test]
    fn delay_clamps_at_max() {
        let p = policy(2.0);
        assert_eq!(p.delay_for(10), MAX_BACKOFF);
        assert_eq!(p.delay_for(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn zero_factor_means_no_sleep() {
        assert_eq!(policy(0.0).delay_for(3), Duration::ZERO);
        assert_eq!(policy(1.0).delay_for(0), Duration::ZERO);
    }

    #[test]
    fn max_attempts_includes_first() {
        assert_eq!(policy(1.0).max_attempts(), 6);
        assert_eq!(RetryPolicy::new(0, 1.0, Duration::ZERO).max_attempts(), 1);
    }

    #[test]
    fn url_joins_relative_endpoints() {
        let p = policy(0.0);
        let client = ResilientClient::with_client(reqwest::Client::new(), "http://h:7860/", p, p);
        assert_eq!(client.url("sdapi/v1/options/"), "http://h:7860/sdapi/v1/options/");
        assert_eq!(client.url("/sdapi/v1/img2img"), "http://h:7860/sdapi/v1/img2img");
        assert_eq!(client.url("https://other/x"), "https://other/x");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        assert_eq!(truncate_body(&body).len(), 515);
        assert_eq!(truncate_body("short"), "short");
    }
}
