//! HTTP client with retry and fallback classification

use crate::{Error, Result};
use reqwest::{Client, Response, redirect};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Default maximum retries per request
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default connect timeout
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default lower bound of the linear backoff window
const DEFAULT_RETRY_MIN_MS: u64 = 100;

/// Default upper bound of the linear backoff window
const DEFAULT_RETRY_MAX_MS: u64 = 10_000;

/// Maximum redirects followed before giving up
const MAX_REDIRECTS: usize = 10;

/// Default user agent, `pget/<version>`
const DEFAULT_USER_AGENT: &str = concat!("pget/", env!("CARGO_PKG_VERSION"));

/// How a request's outcome should be classified.
///
/// In `CacheFleet` mode the transport gives up immediately on errors
/// that should move the caller to the next cache bucket (dial/read
/// failures, 502, 503) instead of retrying the same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Normal retry policy: network errors and 5xx are retried in place
    Standard,
    /// Consistent-hashing fleet request: fallback-class errors are
    /// returned to the caller for bucket selection
    CacheFleet,
}

/// Immutable transport configuration
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Maximum retries per request
    pub max_retries: u32,
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Force HTTP/2 with prior knowledge (disables connection reuse)
    pub force_http2: bool,
    /// Cap on pooled connections per host (0 = reqwest default)
    pub max_conns_per_host: usize,
    /// DNS overrides consulted at dial time, `host -> ip:port`
    pub resolve_overrides: HashMap<String, SocketAddr>,
    /// Optional `Authorization` header value sent with every request
    pub auth_header: Option<String>,
    /// User agent string
    pub user_agent: String,
    /// Lower bound of the linear backoff window
    pub retry_min: Duration,
    /// Upper bound of the linear backoff window
    pub retry_max: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            force_http2: false,
            max_conns_per_host: 0,
            resolve_overrides: HashMap::new(),
            auth_header: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry_min: Duration::from_millis(DEFAULT_RETRY_MIN_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
        }
    }
}

impl ClientOptions {
    /// Parse a `host:port:ip` override as accepted by `--resolve`.
    ///
    /// The request for `host:port` is dialed against `ip:port` instead.
    pub fn parse_resolve_override(entry: &str) -> Result<(String, SocketAddr)> {
        let mut parts = entry.splitn(3, ':');
        let (Some(host), Some(port), Some(ip)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::InvalidResolveOverride {
                entry: entry.to_string(),
            });
        };
        let port: u16 = port.parse().map_err(|_| Error::InvalidResolveOverride {
            entry: entry.to_string(),
        })?;
        let ip: std::net::IpAddr = ip.parse().map_err(|_| Error::InvalidResolveOverride {
            entry: entry.to_string(),
        })?;
        Ok((host.to_string(), SocketAddr::new(ip, port)))
    }
}

/// HTTP client shared by every strategy and worker.
///
/// Thread-safe and cheap to clone; all configuration is fixed at
/// construction.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    options: ClientOptions,
}

impl HttpClient {
    /// Create a new client from the given options
    pub fn new(options: ClientOptions) -> Result<Self> {
        // Redirects are followed silently; each hop is logged so the
        // post-redirect URL in the response can be traced back.
        let redirect_policy = redirect::Policy::custom(|attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else {
                debug!(url = %attempt.url(), hops = attempt.previous().len(), "following redirect");
                attempt.follow()
            }
        });

        // No overall request timeout: transfers of very large chunks are
        // expected to take minutes. The retry budget bounds total attempts.
        let mut builder = Client::builder()
            .connect_timeout(options.connect_timeout)
            .redirect(redirect_policy)
            .use_rustls_tls();

        if options.max_conns_per_host > 0 {
            builder = builder.pool_max_idle_per_host(options.max_conns_per_host);
        }

        if options.force_http2 {
            builder = builder.http2_prior_knowledge().pool_max_idle_per_host(0);
        }

        for (host, addr) in &options.resolve_overrides {
            builder = builder.resolve(host, *addr);
        }

        let client = builder.build()?;
        Ok(Self { client, options })
    }

    /// The configured options
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Issue a `GET` with a `Range: bytes=start-end` header (inclusive)
    pub async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        mode: RequestMode,
    ) -> Result<Response> {
        let range = format!("bytes={start}-{end}");
        trace!(url, %range, "range request");
        self.get_with_headers(url, &[("Range", &range)], mode).await
    }

    /// Issue a `GET` with no extra headers
    pub async fn get(&self, url: &str, mode: RequestMode) -> Result<Response> {
        self.get_with_headers(url, &[], mode).await
    }

    /// Issue a `GET` with additional headers and retry logic.
    ///
    /// Returns `Ok` only for 2xx responses; any other terminal status is
    /// an `UnexpectedStatus` error carrying the code.
    pub async fn get_with_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        mode: RequestMode,
    ) -> Result<Response> {
        let mut last_error = None;
        let mut retry_after: Option<Duration> = None;

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                let backoff = self.backoff_delay(attempt, retry_after.take());
                debug!(url, attempt, ?backoff, "retrying after backoff");
                sleep(backoff).await;
            }

            let mut request = self
                .client
                .get(url)
                .header("User-Agent", &self.options.user_agent);
            if let Some(ref auth) = self.options.auth_header {
                request = request.header("Authorization", auth);
            }
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    trace!(url, status = status.as_u16(), "response");

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                        && attempt < self.options.max_retries
                    {
                        retry_after = parse_retry_after(&response);
                        warn!(url, attempt, ?retry_after, "rate limited");
                        last_error = Some(Error::unexpected_status(status.as_u16(), url));
                        continue;
                    }

                    // 502/503 from a cache node means the bucket is bad;
                    // the caller must rehash, not hammer the same host.
                    if mode == RequestMode::CacheFleet
                        && matches!(status.as_u16(), 502 | 503)
                    {
                        return Err(Error::unexpected_status(status.as_u16(), url));
                    }

                    if status.is_server_error() && attempt < self.options.max_retries {
                        warn!(url, status = status.as_u16(), attempt, "server error, will retry");
                        last_error = Some(Error::unexpected_status(status.as_u16(), url));
                        continue;
                    }

                    return Err(Error::unexpected_status(status.as_u16(), url));
                }
                Err(e) => {
                    // Transport failures against a cache node are the
                    // caller's signal to pick a different bucket.
                    if mode == RequestMode::CacheFleet {
                        return Err(Error::Http(e));
                    }

                    let retryable = e.is_connect() || e.is_timeout() || e.is_request();
                    if retryable && attempt < self.options.max_retries {
                        warn!(url, attempt, error = %e, "request failed, will retry");
                        last_error = Some(Error::Http(e));
                    } else {
                        debug!(url, attempt, error = %e, "request failed, not retrying");
                        return Err(Error::Http(e));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::RetriesExhausted {
            url: url.to_string(),
            attempts: self.options.max_retries + 1,
        }))
    }

    /// Delay before the given attempt (1-based).
    ///
    /// Linear backoff bounded by `[retry_min, retry_max]` plus up to one
    /// `retry_min` of jitter. A `Retry-After` value replaces the linear
    /// base entirely, so only jitter is added on top of it.
    fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jitter = self.options.retry_min.mul_f64(rand::random::<f64>());
        match retry_after {
            Some(wait) => wait + jitter,
            None => {
                let base = self
                    .options
                    .retry_min
                    .saturating_mul(attempt)
                    .min(self.options.retry_max);
                base + jitter
            }
        }
    }
}

/// Parse a `Retry-After` header: either absolute seconds or an HTTP-date
fn parse_retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get("retry-after")?.to_str().ok()?;
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = date.signed_duration_since(chrono::Utc::now());
    wait.to_std().ok()
}
