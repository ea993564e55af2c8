//! Retrying HTTP fetcher shared by every network-backed snapshot source.
//!
//! Throttled and unavailable answers are retried, honoring `Retry-After`
//! when the server sends one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// How many times a failed request is repeated, and how long to wait.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (zero based). A server-provided
    /// `Retry-After` replaces the exponential step; both are capped.
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let step = retry_after.unwrap_or_else(|| {
            let factor = u32::try_from(attempt)
                .ok()
                .and_then(|shift| 1u32.checked_shl(shift))
                .unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        step.min(self.max_delay)
    }
}

/// Server overload, throttling and gateway failures are worth waiting out.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored and the
/// exponential step applies.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    /// Requests sent, including the successful one.
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// One failed request: either worth repeating after a wait, or final.
enum Failure {
    Transient {
        error: FetchError,
        retry_after: Option<Duration>,
    },
    Final(FetchError),
}

/// HTTP client with a global and a per-source concurrency cap.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn source_limit(&self, source_id: &str) -> Arc<Semaphore> {
        self.per_source
            .lock()
            .await
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url` on behalf of `source_id`, holding one global and one
    /// per-source permit for the whole retry sequence.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let source_limit = self.source_limit(source_id).await;
        let _source = source_limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let (error, retry_after) = match self.attempt(url).await {
                Ok(mut response) => {
                    response.attempts = attempt + 1;
                    return Ok(response);
                }
                Err(Failure::Final(error)) => return Err(error),
                Err(Failure::Transient { error, retry_after }) => (error, retry_after),
            };
            if attempt >= self.retry.max_retries {
                return Err(error);
            }
            let wait = self.retry.delay(attempt, retry_after);
            warn!(attempt, error = %error, wait_ms = wait.as_millis() as u64, "transient fetch failure");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, Failure> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() || err.is_connect() || err.is_request() => {
                return Err(Failure::Transient {
                    error: FetchError::Request(err),
                    retry_after: None,
                })
            }
            Err(err) => return Err(Failure::Final(FetchError::Request(err))),
        };

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let error = FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            };
            return Err(if is_transient_status(status) {
                Failure::Transient {
                    error,
                    retry_after: retry_after(response.headers()),
                }
            } else {
                Failure::Final(error)
            });
        }

        // A body cut off mid-transfer is as transient as a refused connection.
        let body = response.bytes().await.map_err(|err| Failure::Transient {
            error: FetchError::Request(err),
            retry_after: None,
        })?;
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body: body.to_vec(),
            attempts: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn quick_retries(max_retries: usize) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(20),
            },
            ..FetcherConfig::default()
        }
    }

    /// Answers each connection with the next canned response, then closes.
    async fn scripted_server(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/listing.json")
    }

    #[test]
    fn delay_grows_exponentially_and_honors_retry_after() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay(2, None), Duration::from_millis(400));
        assert_eq!(policy.delay(40, None), Duration::from_secs(2));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(1))), Duration::from_secs(1));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(600))), Duration::from_secs(2));
    }

    #[test]
    fn throttling_and_outages_are_transient() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn retry_after_reads_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 7 "));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test]
    async fn throttled_export_is_retried_until_it_answers() {
        let url = scripted_server(vec![
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 0\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 13\r\nConnection: close\r\n\r\n{\"pages\": []}",
        ])
        .await;
        let fetcher = HttpFetcher::new(quick_retries(2)).expect("fetcher");

        let response = fetcher
            .fetch_bytes(Uuid::new_v4(), "register", &url)
            .await
            .expect("second attempt succeeds");
        assert_eq!(response.attempts, 2);
        assert_eq!(response.body, br#"{"pages": []}"#.to_vec());
    }

    #[tokio::test]
    async fn missing_export_is_not_retried() {
        let url = scripted_server(vec![
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ])
        .await;
        let fetcher = HttpFetcher::new(quick_retries(3)).expect("fetcher");

        let err = fetcher
            .fetch_bytes(Uuid::new_v4(), "register", &url)
            .await
            .expect_err("404 is final");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn unreachable_host_surfaces_as_request_error() {
        let fetcher = HttpFetcher::new(quick_retries(1)).expect("fetcher");
        let err = fetcher
            .fetch_bytes(Uuid::new_v4(), "register", "http://127.0.0.1:9/listing.json")
            .await
            .expect_err("nothing listens on the discard port");
        assert!(matches!(err, FetchError::Request(_)));
    }
}
