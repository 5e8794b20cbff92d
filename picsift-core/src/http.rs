use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{NetworkSection, RetrySection};

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport { source: reqwest::Error, url: String },
    #[error("{url} answered status {status}")]
    Status { status: StatusCode, url: String },
    #[error("failed to read body from {url}: {source}")]
    Body { source: reqwest::Error, url: String },
}

impl FetchError {
    /// Timeouts, connection failures, 5xx and 429 are worth another attempt;
    /// all other client errors are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Body { .. } => true,
            FetchError::Client(_) => false,
        }
    }

    /// Short classification used when absorbing an error into the query log.
    pub fn class(&self) -> &'static str {
        match self {
            FetchError::Transport { source, .. } if source.is_timeout() => "timeout",
            FetchError::Transport { .. } => "transport",
            FetchError::Status { .. } => "status",
            FetchError::Body { .. } => "body",
            FetchError::Client(_) => "client",
        }
    }
}

/// One retry schedule shared by every outbound fetch path: search providers,
/// page fetches, robots probes and image downloads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetrySection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// No waiting before the first attempt; doubling afterwards, capped.
    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(16) as u32);
        let mut delay = exp.min(self.max_delay);
        if !self.jitter.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            delay += Duration::from_millis(jitter_ms);
        }
        delay
    }

    pub async fn run<F, Fut, T>(&self, url: &str, mut operation: F) -> FetchResult<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let mut attempt = 0usize;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !error.is_transient() {
                        return Err(error);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient fetch failure, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    /// URL after redirects; the base for resolving relative references.
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct FetchedBytes {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Thin wrapper around one shared reqwest client. Owns no discovery logic;
/// callers decide what a non-success status means for them.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(network: &NetworkSection, retry: RetryPolicy) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(network.user_agent.clone())
            .timeout(Duration::from_secs(network.request_timeout_seconds))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client, retry })
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn fetch_text(&self, url: &str) -> FetchResult<FetchedPage> {
        let client = self.client.clone();
        self.retry
            .run(url, |attempt| {
                let client = client.clone();
                let url = url.to_string();
                async move {
                    debug!(url = %url, attempt, "fetching page");
                    let response = client.get(&url).send().await.map_err(|source| {
                        FetchError::Transport {
                            source,
                            url: url.clone(),
                        }
                    })?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(FetchError::Status {
                            status,
                            url: url.clone(),
                        });
                    }
                    let final_url = response.url().to_string();
                    let body = response.text().await.map_err(|source| FetchError::Body {
                        source,
                        url: url.clone(),
                    })?;
                    Ok(FetchedPage {
                        status: status.as_u16(),
                        final_url,
                        body,
                    })
                }
            })
            .await
    }

    pub async fn fetch_bytes(&self, url: &str) -> FetchResult<FetchedBytes> {
        self.fetch_bytes_capped(url, None).await
    }

    /// Fetch at most `max_bytes` of the body, dropping the connection once the
    /// cap is reached. Used by the dimension probe to read image headers.
    pub async fn fetch_head_bytes(&self, url: &str, max_bytes: usize) -> FetchResult<FetchedBytes> {
        self.fetch_bytes_capped(url, Some(max_bytes)).await
    }

    async fn fetch_bytes_capped(
        &self,
        url: &str,
        max_bytes: Option<usize>,
    ) -> FetchResult<FetchedBytes> {
        let client = self.client.clone();
        self.retry
            .run(url, |attempt| {
                let client = client.clone();
                let url = url.to_string();
                async move {
                    debug!(url = %url, attempt, capped = max_bytes.is_some(), "fetching bytes");
                    let mut request = client.get(&url);
                    if let Some(cap) = max_bytes {
                        request = request.header("Range", format!("bytes=0-{}", cap - 1));
                    }
                    let response =
                        request
                            .send()
                            .await
                            .map_err(|source| FetchError::Transport {
                                source,
                                url: url.clone(),
                            })?;
                    let status = response.status();
                    // 206 Partial Content is success for ranged requests.
                    if !status.is_success() {
                        return Err(FetchError::Status {
                            status,
                            url: url.clone(),
                        });
                    }
                    let final_url = response.url().to_string();
                    let content_type = response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|value| value.to_str().ok())
                        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());

                    let mut bytes = Vec::new();
                    let mut stream = response.bytes_stream();
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk.map_err(|source| FetchError::Body {
                            source,
                            url: url.clone(),
                        })?;
                        bytes.extend_from_slice(&chunk);
                        if let Some(cap) = max_bytes {
                            if bytes.len() >= cap {
                                bytes.truncate(cap);
                                break;
                            }
                        }
                    }
                    Ok(FetchedBytes {
                        status: status.as_u16(),
                        final_url,
                        content_type,
                        bytes,
                    })
                }
            })
            .await
    }
}

/// Byte-fetch seam for the downloader, so batch logic is testable without a
/// network.
#[async_trait::async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch_resource(&self, url: &str) -> FetchResult<FetchedBytes>;
}

#[async_trait::async_trait]
impl ResourceFetcher for HttpClient {
    async fn fetch_resource(&self, url: &str) -> FetchResult<FetchedBytes> {
        self.fetch_bytes(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(&RetrySection {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
        })
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let attempts = std::cell::Cell::new(0usize);
        let result = policy(3)
            .run("https://example.com", |_| {
                let n = attempts.get();
                attempts.set(n + 1);
                async move {
                    if n == 0 {
                        Err(FetchError::Status {
                            status: StatusCode::SERVICE_UNAVAILABLE,
                            url: "https://example.com".into(),
                        })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "ok");
        assert_eq!(attempts.get(), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_status() {
        let attempts = std::cell::Cell::new(0usize);
        let result: FetchResult<()> = policy(3)
            .run("https://example.com/missing", |_| {
                attempts.set(attempts.get() + 1);
                async {
                    Err(FetchError::Status {
                        status: StatusCode::NOT_FOUND,
                        url: "https://example.com/missing".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1, "4xx must not be retried");
    }

    #[tokio::test]
    async fn retry_exhausts_attempts_on_repeated_5xx() {
        let attempts = std::cell::Cell::new(0usize);
        let result: FetchResult<()> = policy(3)
            .run("https://example.com/busy", |_| {
                attempts.set(attempts.get() + 1);
                async {
                    Err(FetchError::Status {
                        status: StatusCode::BAD_GATEWAY,
                        url: "https://example.com/busy".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
    }
}
