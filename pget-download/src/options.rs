//! Download configuration

use crate::{Error, Result};
use pget_client::ClientOptions;
use std::collections::HashMap;

/// Default chunk size: 125 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 125 * 1024 * 1024;

/// Default slice size for consistent hashing: 500 MiB
pub const DEFAULT_SLICE_SIZE: u64 = 500 * 1024 * 1024;

/// Default cap on concurrently downloading files in multi-file mode
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 20;

/// Immutable configuration for a [`crate::Getter`] and its strategy.
///
/// Constructed once at startup and shared by reference; nothing here is
/// mutated after validation.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Maximum simultaneously executing range requests (>= 1)
    pub max_concurrency: usize,
    /// Bytes per range request
    pub chunk_size: u64,
    /// Slice size for consistent hashing; chunks never straddle a slice
    pub slice_size: u64,
    /// Hosts whose URLs may be served from the cache fleet, with optional
    /// path prefixes narrowing the match (empty list = whole host)
    pub cacheable_uri_prefixes: HashMap<String, Vec<String>>,
    /// Ordered cache nodes; an empty string marks an unavailable slot
    pub cache_hosts: Vec<String>,
    /// Route cache requests as `http://cache/<origin-host>/<path>`
    pub cache_use_path_proxy: bool,
    /// Concurrent file cap for multi-file downloads (0 = unlimited)
    pub max_concurrent_files: usize,
    /// Overwrite existing destinations
    pub force: bool,
    /// Transport configuration
    pub client: ClientOptions,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            slice_size: DEFAULT_SLICE_SIZE,
            cacheable_uri_prefixes: HashMap::new(),
            cache_hosts: Vec::new(),
            cache_use_path_proxy: false,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            force: false,
            client: ClientOptions::default(),
        }
    }
}

impl DownloadOptions {
    /// Reject invalid combinations before any network or disk I/O
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::config("max concurrency must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(Error::config("chunk size must be at least 1 byte"));
        }
        if self.slice_size == 0 {
            return Err(Error::config("slice size must be at least 1 byte"));
        }
        Ok(())
    }

    /// Chunk size actually used in consistent-hashing mode
    pub fn effective_chunk_size(&self) -> u64 {
        self.chunk_size.min(self.slice_size)
    }
}

/// Default worker count: four per CPU, the sweet spot for network-bound
/// range requests
fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(16)
}
