//! Outbound HTTP with bounded exponential backoff.
//!
//! [`RetryingFetcher`] retries 429 and 5xx answers (and transport failures)
//! up to a fixed number of attempts. Any other status fails immediately.
//! Tokens are supplied per request by the caller.

use crate::clock::Clock;
use crate::config::FetchSettings;
use crate::error::FetchError;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Longest upstream body excerpt kept in an error message.
const ERROR_BODY_EXCERPT: usize = 200;

/// A single GET request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub bearer: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer: None,
        }
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

/// Raw response as seen by the retry loop.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

/// Successful download.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Performs one HTTP exchange. Errors are transport-level only.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &FetchRequest) -> Result<HttpResponse, String>;
}

/// Transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &FetchRequest) -> Result<HttpResponse, String> {
        let mut builder = self.client.get(&request.url);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let headers = response.headers();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            content_type,
            retry_after,
            body,
        })
    }
}

/// Delay before retry `attempt` (0-based): `initial * 2^attempt`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

fn is_retryable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(ERROR_BODY_EXCERPT).collect()
}

/// Stateless retry wrapper around an [`HttpTransport`].
#[derive(Clone)]
pub struct RetryingFetcher {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
    max_attempts: u32,
}

impl RetryingFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        policy: BackoffPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            transport,
            clock,
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_settings(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        settings: &FetchSettings,
    ) -> Self {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(settings.initial_delay_ms),
            max: Duration::from_millis(settings.max_delay_ms),
        };
        Self::new(transport, clock, policy, settings.max_attempts)
    }

    /// Fetch `request`, retrying rate limits and server errors.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
        let mut last_error = FetchError::Transport("no attempt made".into());

        for attempt in 0..self.max_attempts {
            let mut retry_after = None;

            match self.transport.send(request).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    return Ok(Fetched {
                        bytes: response.body,
                        content_type: response.content_type,
                    });
                }
                Ok(response) if is_retryable(response.status) => {
                    if response.status == 429 {
                        retry_after = response.retry_after;
                    }
                    last_error = FetchError::Upstream {
                        status: response.status,
                        message: body_excerpt(&response.body),
                    };
                }
                Ok(response) => {
                    return Err(FetchError::Upstream {
                        status: response.status,
                        message: body_excerpt(&response.body),
                    });
                }
                Err(cause) => {
                    last_error = FetchError::Transport(cause);
                }
            }

            if attempt + 1 >= self.max_attempts {
                break;
            }

            let mut delay = self.policy.delay(attempt);
            if let Some(hint) = retry_after {
                delay = delay.max(hint).min(self.policy.max);
            }
            tracing::warn!(
                "Attempt {}/{} for {} failed ({}), retrying in {:?}",
                attempt + 1,
                self.max_attempts,
                request.url,
                last_error,
                delay
            );
            self.clock.sleep(delay).await;
        }

        Err(last_error)
    }

    /// Fetch and decode a JSON body.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: &FetchRequest,
    ) -> Result<T, FetchError> {
        let fetched = self.fetch(request).await?;
        serde_json::from_slice(&fetched.bytes).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that replays a fixed script of outcomes and records URLs.
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Result<HttpResponse, String>>>,
        pub requests: Mutex<Vec<FetchRequest>>,
    }

    impl ScriptedTransport {
        pub fn new(script: Vec<Result<HttpResponse, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    pub fn status(code: u16) -> Result<HttpResponse, String> {
        Ok(HttpResponse {
            status: code,
            content_type: None,
            retry_after: None,
            body: Bytes::from_static(b"error body"),
        })
    }

    pub fn ok(body: &'static [u8], content_type: &str) -> Result<HttpResponse, String> {
        Ok(HttpResponse {
            status: 200,
            content_type: Some(content_type.to_string()),
            retry_after: None,
            body: Bytes::from_static(body),
        })
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: &FetchRequest) -> Result<HttpResponse, String> {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".into()))
        }
    }
}
