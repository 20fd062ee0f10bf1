//! Parallel range-request download engine
//!
//! This crate turns a single logical HTTP download into many concurrent
//! range requests and reassembles the bytes in order for a streaming
//! consumer. It provides:
//!
//! - A shared priority work queue that prefers finishing in-flight files
//!   over starting new ones
//! - A bounded buffer pool keeping memory at `concurrency x chunk_size`
//! - Ordered reassembly through per-chunk one-shot readers concatenated
//!   by a channel-fed composite reader
//! - Two fetch strategies: plain buffer mode against the origin, and
//!   consistent hashing across a fleet of cache nodes with bucket and
//!   origin fallback
//! - A single/multi-file getter that pairs a strategy with a consumer
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pget_download::{BufferMode, DownloadOptions, FileWriter, Getter};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = Arc::new(DownloadOptions::default());
//! let strategy = Arc::new(BufferMode::new(options.clone())?);
//! let getter = Getter::new(strategy, Arc::new(FileWriter::default()), options);
//! getter
//!     .download_file(
//!         "https://example.com/weights.bin",
//!         "weights.bin".as_ref(),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod buffer_mode;
mod consistent_hash;
mod consumer;
mod error;
mod getter;
pub mod hash;
mod manifest;
mod options;
pub mod plan;
mod pool;
mod queue;
mod reader;
mod rewrite;
mod sequence;
mod strategy;

pub use buffer_mode::BufferMode;
pub use consistent_hash::ConsistentHashing;
pub use consumer::{ByteStream, ConsumeError, Consumer, FileWriter, NullWriter};
pub use error::{Error, Result};
pub use getter::{DownloadSummary, FileSummary, Getter};
pub use manifest::{Manifest, ManifestEntry};
pub use options::DownloadOptions;
pub use pool::{BufferPool, PooledBuf};
pub use queue::WorkQueue;
pub use reader::{BufferedReader, ChunkWriter, chunk_pipe};
pub use sequence::ReaderSequence;
pub use strategy::{Fetched, Strategy};
