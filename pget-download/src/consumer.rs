//! Streaming consumers: turn the assembled byte stream into disk state

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// The ordered byte stream handed to a consumer
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Error types for consumers
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// IO error while materializing the stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Destination exists and overwrite is disabled
    #[error("destination already exists: {}", path.display())]
    DestinationExists {
        /// The existing path
        path: PathBuf,
    },

    /// Byte count differs from the size the server announced
    #[error("size mismatch: expected {expected} bytes, wrote {actual}")]
    SizeMismatch {
        /// Expected number of bytes
        expected: u64,
        /// Bytes actually consumed
        actual: u64,
    },

    /// An archive entry would escape the destination directory
    #[error("archive entry escapes destination: {entry}")]
    PathEscapes {
        /// The offending entry name
        entry: String,
    },

    /// An archive entry kind this consumer refuses to create
    #[error("unsupported archive entry {name:?} ({kind})")]
    UnsupportedEntry {
        /// Entry name from the archive header
        name: String,
        /// Human-readable entry kind
        kind: String,
    },

    /// An archive header with an empty name
    #[error("archive entry with empty name")]
    EmptyEntryName,

    /// Archive-format level failure
    #[error("archive error: {reason}")]
    Archive {
        /// What went wrong
        reason: String,
    },
}

/// A sink for one downloaded file.
///
/// The consumer pulls bytes from the stream; backpressure propagates to
/// the range-request producers through the buffered readers. On error a
/// consumer must not leave a partial destination behind.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Materialize `reader` at `dest`.
    ///
    /// `expected_size` is the server-announced size (0 when unknown);
    /// `content_type` is advisory.
    async fn consume(
        &self,
        reader: ByteStream,
        dest: &Path,
        expected_size: u64,
        content_type: Option<&str>,
    ) -> Result<(), ConsumeError>;

    /// Allow replacing an existing destination
    fn enable_overwrite(&mut self);
}

/// Writes the stream verbatim to a file
#[derive(Debug, Clone, Default)]
pub struct FileWriter {
    overwrite: bool,
}

impl FileWriter {
    /// Create a writer; `overwrite` truncates an existing destination
    /// instead of failing
    pub fn new(overwrite: bool) -> Self {
        Self { overwrite }
    }
}

#[async_trait]
impl Consumer for FileWriter {
    async fn consume(
        &self,
        mut reader: ByteStream,
        dest: &Path,
        expected_size: u64,
        _content_type: Option<&str>,
    ) -> Result<(), ConsumeError> {
        let mut file = if self.overwrite {
            tokio::fs::File::create(dest).await?
        } else {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dest)
                .await
                .map_err(|err| {
                    if err.kind() == std::io::ErrorKind::AlreadyExists {
                        ConsumeError::DestinationExists {
                            path: dest.to_path_buf(),
                        }
                    } else {
                        ConsumeError::Io(err)
                    }
                })?
        };

        let copied = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(copied) => copied,
            Err(err) => {
                drop(file);
                remove_partial(dest).await;
                return Err(ConsumeError::Io(err));
            }
        };
        file.flush().await?;

        if expected_size > 0 && copied != expected_size {
            drop(file);
            remove_partial(dest).await;
            return Err(ConsumeError::SizeMismatch {
                expected: expected_size,
                actual: copied,
            });
        }
        Ok(())
    }

    fn enable_overwrite(&mut self) {
        self.overwrite = true;
    }
}

/// Drains the stream and verifies the byte count; writes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWriter;

#[async_trait]
impl Consumer for NullWriter {
    async fn consume(
        &self,
        mut reader: ByteStream,
        _dest: &Path,
        expected_size: u64,
        _content_type: Option<&str>,
    ) -> Result<(), ConsumeError> {
        let mut sink = tokio::io::sink();
        let drained = tokio::io::copy(&mut reader, &mut sink).await?;
        if expected_size > 0 && drained != expected_size {
            return Err(ConsumeError::SizeMismatch {
                expected: expected_size,
                actual: drained,
            });
        }
        Ok(())
    }

    fn enable_overwrite(&mut self) {}
}

/// Best effort: a failed consume must not leave partial output
async fn remove_partial(dest: &Path) {
    if let Err(err) = tokio::fs::remove_file(dest).await {
        tracing::warn!(dest = %dest.display(), error = %err, "failed to remove partial file");
    }
}
