//! The fetch strategy seam

use crate::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// The result of a fetch: an ordered byte stream plus metadata.
///
/// Reading the stream to EOF yields exactly `size` bytes identical to
/// the server's representation, regardless of how many range requests
/// produced them or in what order those completed.
pub struct Fetched {
    /// Ordered stream of the file's bytes
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Total file size in bytes
    pub size: u64,
    /// `Content-Type` reported by the server, if any
    pub content_type: Option<String>,
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetched")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// How a file's bytes are obtained.
///
/// Implementations schedule their range requests on a shared work queue
/// and return immediately once the size is known; chunks keep arriving
/// while the caller reads.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Start downloading `url`, returning the assembled stream
    async fn fetch(&self, url: &str, cancel: CancellationToken) -> Result<Fetched>;
}
