//! Pairs a fetch strategy with a consumer

use crate::consumer::Consumer;
use crate::manifest::Manifest;
use crate::strategy::Strategy;
use crate::{DownloadOptions, Error, Result};
use futures_util::StreamExt;
use futures_util::stream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Outcome of a single file download
#[derive(Debug, Clone, Copy)]
pub struct FileSummary {
    /// Bytes delivered to the consumer
    pub bytes: u64,
    /// Wall-clock duration of the download
    pub elapsed: Duration,
}

/// Outcome of a multi-file download
#[derive(Debug, Clone, Copy)]
pub struct DownloadSummary {
    /// Files completed
    pub files: usize,
    /// Total bytes across all files
    pub bytes: u64,
    /// Wall-clock duration of the whole run
    pub elapsed: Duration,
}

impl DownloadSummary {
    /// Aggregate throughput in bytes per second
    pub fn throughput(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.bytes as f64 / self.elapsed.as_secs_f64()
    }
}

/// Drives downloads: one strategy, one consumer, shared options.
///
/// All files drawn through one getter share the strategy's work queue
/// and connection pool, so concurrency limits hold across files.
pub struct Getter {
    strategy: Arc<dyn Strategy>,
    consumer: Arc<dyn Consumer>,
    options: Arc<DownloadOptions>,
}

impl Getter {
    /// Pair a strategy with a consumer
    pub fn new(
        strategy: Arc<dyn Strategy>,
        consumer: Arc<dyn Consumer>,
        options: Arc<DownloadOptions>,
    ) -> Self {
        Self {
            strategy,
            consumer,
            options,
        }
    }

    /// Download one file to `dest`.
    ///
    /// Fails with [`Error::DestinationExists`] before any network I/O
    /// when the destination is present and force is off.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        cancel: CancellationToken,
    ) -> Result<FileSummary> {
        if !self.options.force && tokio::fs::try_exists(dest).await.unwrap_or(false) {
            return Err(Error::DestinationExists {
                path: dest.to_path_buf(),
            });
        }

        let started = Instant::now();
        let fetched = self.strategy.fetch(url, cancel).await?;
        self.consumer
            .consume(
                fetched.reader,
                dest,
                fetched.size,
                fetched.content_type.as_deref(),
            )
            .await?;

        let elapsed = started.elapsed();
        info!(
            url,
            dest = %dest.display(),
            bytes = fetched.size,
            elapsed_ms = elapsed.as_millis() as u64,
            "download complete"
        );
        Ok(FileSummary {
            bytes: fetched.size,
            elapsed,
        })
    }

    /// Download every manifest entry.
    ///
    /// Runs at most `max_concurrent_files` files at once; on the first
    /// error the remaining work is cancelled, in-flight files are
    /// awaited, and that first error is returned.
    pub async fn download_files(&self, manifest: &Manifest) -> Result<DownloadSummary> {
        let limit = match self.options.max_concurrent_files {
            0 => usize::MAX,
            n => n,
        };
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let mut in_flight = stream::iter(manifest.entries().cloned().collect::<Vec<_>>())
            .map(|entry| {
                let cancel = cancel.clone();
                async move {
                    let result = tokio::select! {
                        () = cancel.cancelled() => Err(Error::Cancelled),
                        result = self.download_file(&entry.url, &entry.dest, cancel.clone()) => result,
                    };
                    (entry, result)
                }
            })
            .buffer_unordered(limit);

        let mut first_error = None;
        let mut files = 0;
        let mut bytes = 0;
        while let Some((entry, result)) = in_flight.next().await {
            match result {
                Ok(summary) => {
                    files += 1;
                    bytes += summary.bytes;
                }
                Err(err) => {
                    if first_error.is_none() {
                        error!(url = %entry.url, error = %err, "download failed, cancelling the rest");
                        cancel.cancel();
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let summary = DownloadSummary {
            files,
            bytes,
            elapsed: started.elapsed(),
        };
        info!(
            files = summary.files,
            bytes = summary.bytes,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            throughput_bps = summary.throughput() as u64,
            "all downloads complete"
        );
        Ok(summary)
    }
}
