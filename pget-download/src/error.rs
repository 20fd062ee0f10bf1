//! Error types for the download engine

use std::path::PathBuf;
use thiserror::Error;

/// Error types for download operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure
    #[error(transparent)]
    Client(#[from] pget_client::Error),

    /// Invalid configuration, rejected before any I/O
    #[error("invalid configuration: {reason}")]
    Config {
        /// What was wrong
        reason: String,
    },

    /// Destination already exists and force was not set
    #[error("destination already exists: {}", path.display())]
    DestinationExists {
        /// The existing path
        path: PathBuf,
    },

    /// The server gave no usable length for the file
    #[error("no content length available for {url}")]
    MissingContentLength {
        /// The request URL
        url: String,
    },

    /// A response body was larger than the chunk buffer
    #[error("response of {length} bytes exceeds chunk buffer of {capacity} bytes")]
    ChunkTooLarge {
        /// Announced or received body length
        length: u64,
        /// Buffer capacity
        capacity: u64,
    },

    /// Downloaded byte count differs from the expected count
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Expected number of bytes
        expected: u64,
        /// Actual number of bytes
        actual: u64,
    },

    /// Every cache bucket was tried for a chunk without success
    #[error("all cache buckets exhausted for {url}")]
    CacheFleetExhausted {
        /// The origin URL being fetched
        url: String,
    },

    /// A URL could not be parsed
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL
        url: String,
    },

    /// A manifest line was not `URL DEST`
    #[error("malformed manifest line {line}: {content:?}")]
    InvalidManifestLine {
        /// 1-based line number
        line: usize,
        /// The offending line
        content: String,
    },

    /// The same destination appears twice with different URLs
    #[error("duplicate destination {} for {url} (already assigned to {previous})", dest.display())]
    DuplicateDestination {
        /// The duplicated destination
        dest: PathBuf,
        /// The second URL
        url: String,
        /// The URL already mapped to the destination
        previous: String,
    },

    /// Consumer failed to materialize the stream
    #[error(transparent)]
    Consume(#[from] crate::ConsumeError),

    /// Download was cancelled
    #[error("download cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for download operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create an invalid URL error
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}
