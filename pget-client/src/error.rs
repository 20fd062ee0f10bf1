//! Error types for the pget HTTP transport

use thiserror::Error;

/// Error types for transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server responded with a status outside `[200, 300)`
    #[error("unexpected HTTP status {status} for {url}")]
    UnexpectedStatus {
        /// The response status code
        status: u16,
        /// The request URL
        url: String,
    },

    /// All retry attempts were used up
    #[error("retries exhausted after {attempts} attempts for {url}")]
    RetriesExhausted {
        /// The request URL
        url: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// A malformed DNS override was supplied
    #[error("invalid resolve override: {entry}")]
    InvalidResolveOverride {
        /// The offending `host:port:ip` entry
        entry: String,
    },
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an unexpected status error
    pub fn unexpected_status(status: u16, url: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            status,
            url: url.into(),
        }
    }

    /// Status code carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether a cache bucket should be abandoned for this error.
    ///
    /// Covers dial failures, DNS timeout/not-found, read failures,
    /// connections closed mid-body, and HTTP 502/503. Anything in this
    /// class means the next bucket must be tried rather than the same
    /// host again.
    pub fn is_fallback(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_connect() || e.is_timeout() || e.is_body() || e.is_decode() || e.is_request()
            }
            Self::UnexpectedStatus { status, .. } => matches!(status, 502 | 503),
            Self::RetriesExhausted { .. } | Self::InvalidResolveOverride { .. } => false,
        }
    }

    /// Whether this error is a terminal HTTP status (4xx other than 429)
    pub fn is_fatal_status(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedStatus { status, .. }
                if (400..500).contains(status) && *status != 429
        )
    }
}
