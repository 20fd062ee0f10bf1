//! Consistent-hashing strategy across a fleet of cache nodes
//!
//! Every slice of a file hashes to one cache bucket, so repeated
//! downloads of the same URL land on the same nodes and stay cached.
//! A failing bucket is retried against the next distinct bucket via the
//! exclusion-aware jump hash; when every bucket has been tried, the
//! first chunk falls back to a whole-file buffer-mode fetch and later
//! chunks fall back individually to the origin.

use crate::buffer_mode::{
    BufferMode, FileInfo, RequestTarget, parse_file_info, read_range_into, request_range,
};
use crate::hash::{CacheKey, bucket_for, structural_hash};
use crate::pool::BufferPool;
use crate::reader::{ChunkWriter, chunk_pipe};
use crate::rewrite::{is_cacheable, rewrite_to_cache_host};
use crate::sequence::ReaderSequence;
use crate::strategy::{Fetched, Strategy};
use crate::{DownloadOptions, Error, Result};
use async_trait::async_trait;
use pget_client::{HttpClient, RequestMode};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Fetch strategy routing slices to cache nodes by jump-consistent hash
#[derive(Debug, Clone)]
pub struct ConsistentHashing {
    fallback: BufferMode,
    options: Arc<DownloadOptions>,
}

/// Everything a fleet task needs, cheap to clone into queue jobs
#[derive(Debug, Clone)]
struct FleetContext {
    client: HttpClient,
    pool: BufferPool,
    options: Arc<DownloadOptions>,
    origin_url: Url,
    origin: String,
}

impl FleetContext {
    fn cache_target(&self, host: &str) -> Result<RequestTarget> {
        let rewritten = rewrite_to_cache_host(
            &self.origin_url,
            host,
            self.options.cache_use_path_proxy,
            "http",
        )?;
        Ok(RequestTarget {
            url: rewritten.url,
            host_header: rewritten.host_header,
        })
    }
}

impl ConsistentHashing {
    /// Create a strategy with its own buffer-mode fallback; the two
    /// share one client, work queue, and buffer pool
    pub fn new(options: Arc<DownloadOptions>) -> Result<Self> {
        let fallback = BufferMode::new(options.clone())?;
        Ok(Self { fallback, options })
    }

    /// Whether the fleet applies to this URL at all.
    ///
    /// Needs at least two configured slots (empty ones count: a degraded
    /// fleet keeps hashing so bucket fallback still applies) and a
    /// cacheable-prefix match.
    fn fleet_applies(&self, url: &Url) -> bool {
        self.options.cache_hosts.len() >= 2
            && is_cacheable(&self.options.cacheable_uri_prefixes, url)
    }

    fn context(&self, url: &Url) -> FleetContext {
        FleetContext {
            client: self.fallback.client().clone(),
            pool: self.fallback.pool().clone(),
            options: self.options.clone(),
            origin_url: url.clone(),
            origin: url.to_string(),
        }
    }
}

#[async_trait]
impl Strategy for ConsistentHashing {
    async fn fetch(&self, url: &str, cancel: CancellationToken) -> Result<Fetched> {
        let parsed = Url::parse(url).map_err(|_| Error::invalid_url(url))?;
        if !self.fleet_applies(&parsed) {
            debug!(url, "cache fleet not applicable, using buffer mode");
            return self.fallback.fetch(url, cancel).await;
        }

        let ctx = self.context(&parsed);
        let eff_chunk = self.options.effective_chunk_size();

        let (readers_tx, readers_rx) = mpsc::unbounded_channel();
        let (info_tx, info_rx) = oneshot::channel();
        let (first_writer, first_reader) = chunk_pipe();
        let _ = readers_tx.send(first_reader);

        {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            self.fallback.queue().submit_low(async move {
                discover_fleet(ctx, eff_chunk, info_tx, first_writer, cancel).await;
            });
        }

        let info = match info_rx.await {
            Ok(Ok(info)) => info,
            Ok(Err(Error::CacheFleetExhausted { .. })) => {
                warn!(url, "first chunk exhausted all cache buckets, refetching from origin");
                return self.fallback.fetch(url, cancel).await;
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::Cancelled),
        };
        debug!(url, size = info.size, "discovered file size via cache fleet");

        for sc in crate::plan::slice_plan(info.size, self.options.slice_size, eff_chunk)
            .into_iter()
            .skip(1)
        {
            let (writer, reader) = chunk_pipe();
            let _ = readers_tx.send(reader);
            let ctx = ctx.clone();
            let fallback = self.fallback.clone();
            let cancel = cancel.clone();
            self.fallback.queue().submit_high(async move {
                fleet_chunk(ctx, fallback, sc.slice, sc.chunk.start, sc.chunk.end, writer, cancel)
                    .await;
            });
        }

        Ok(Fetched {
            reader: Box::new(ReaderSequence::new(readers_rx)),
            size: info.size,
            content_type: info.content_type,
        })
    }
}

/// Whether an error abandons the current bucket.
///
/// Transport fallback classes plus a short body: a cache node that
/// serves fewer bytes than promised is as unusable as one that refuses
/// the connection.
fn is_bucket_fallback(err: &Error) -> bool {
    match err {
        Error::Client(e) => e.is_fallback(),
        Error::SizeMismatch { .. } => true,
        _ => false,
    }
}

/// First request of a file against the fleet: discover size, fill the
/// first chunk, walking buckets as needed
async fn discover_fleet(
    ctx: FleetContext,
    eff_chunk: u64,
    info_tx: oneshot::Sender<Result<FileInfo>>,
    writer: ChunkWriter,
    cancel: CancellationToken,
) {
    let key = structural_hash(&CacheKey {
        url: &ctx.origin,
        slice_index: 0,
    });
    let buckets = ctx.options.cache_hosts.len();
    let mut previous: Vec<usize> = Vec::new();
    let mut info_tx = Some(info_tx);
    let mut buf = ctx.pool.checkout().await;

    loop {
        if previous.len() == buckets {
            let err = Error::CacheFleetExhausted {
                url: ctx.origin.clone(),
            };
            match info_tx.take() {
                // Size still unknown: the caller refetches the whole
                // file through buffer mode.
                Some(tx) => {
                    let _ = tx.send(Err(err));
                }
                // Stream already promised: surface through the reader.
                None => writer.fail(io::Error::other(err)),
            }
            return;
        }

        let bucket = bucket_for(key, buckets, &previous);
        let host = ctx.options.cache_hosts[bucket].clone();
        if host.is_empty() {
            debug!(bucket, "cache bucket has no host, skipping");
            previous.push(bucket);
            continue;
        }

        let target = match ctx.cache_target(&host) {
            Ok(target) => target,
            Err(err) => {
                if let Some(tx) = info_tx.take() {
                    let _ = tx.send(Err(err));
                } else {
                    writer.fail(io::Error::other(err));
                }
                return;
            }
        };

        let response = match request_range(
            &ctx.client,
            &target,
            0,
            eff_chunk - 1,
            RequestMode::CacheFleet,
            &cancel,
        )
        .await
        {
            Ok(response) => response,
            Err(err) if is_bucket_fallback(&err) => {
                warn!(bucket, %host, error = %err, "cache bucket failed, trying next");
                previous.push(bucket);
                continue;
            }
            Err(err) => {
                if let Some(tx) = info_tx.take() {
                    let _ = tx.send(Err(err));
                } else {
                    writer.fail(io::Error::other(err));
                }
                return;
            }
        };

        let file_info = match parse_file_info(&response) {
            Ok(parsed) => FileInfo {
                // Cache requests are always derived from the origin URL;
                // redirects on a cache node are not followed further.
                final_url: ctx.origin.clone(),
                ..parsed
            },
            Err(err) => {
                if let Some(tx) = info_tx.take() {
                    let _ = tx.send(Err(err));
                } else {
                    writer.fail(io::Error::other(err));
                }
                return;
            }
        };
        if let Some(tx) = info_tx.take() {
            let _ = tx.send(Ok(file_info.clone()));
        }

        if file_info.size == 0 {
            writer.deliver(buf);
            return;
        }

        let end = file_info.size.min(eff_chunk) - 1;
        buf.clear();
        match read_range_into(
            &ctx.client,
            &target,
            0,
            end,
            RequestMode::CacheFleet,
            0,
            Some(response),
            &mut buf,
            &cancel,
        )
        .await
        {
            Ok(()) => {
                writer.deliver(buf);
                return;
            }
            Err(err) if is_bucket_fallback(&err) => {
                warn!(bucket, %host, error = %err, "cache bucket body failed, trying next");
                previous.push(bucket);
            }
            Err(err) => {
                writer.fail(io::Error::other(err));
                return;
            }
        }
    }
}

/// Fill one non-leading chunk from the fleet, falling back to the
/// origin once every bucket has been tried
async fn fleet_chunk(
    ctx: FleetContext,
    fallback: BufferMode,
    slice: u64,
    start: u64,
    end: u64,
    writer: ChunkWriter,
    cancel: CancellationToken,
) {
    let key = structural_hash(&CacheKey {
        url: &ctx.origin,
        slice_index: slice,
    });
    let buckets = ctx.options.cache_hosts.len();
    let mut previous: Vec<usize> = Vec::new();
    let mut buf = ctx.pool.checkout().await;

    loop {
        if previous.len() == buckets {
            info!(slice, start, end, "cache buckets exhausted, serving chunk from origin");
            // Free our pool slot before the origin path takes one.
            drop(buf);
            fallback
                .fill_from_origin(&ctx.origin, start, end, writer, cancel)
                .await;
            return;
        }

        let bucket = bucket_for(key, buckets, &previous);
        let host = ctx.options.cache_hosts[bucket].clone();
        if host.is_empty() {
            debug!(bucket, slice, "cache bucket has no host, skipping");
            previous.push(bucket);
            continue;
        }

        let target = match ctx.cache_target(&host) {
            Ok(target) => target,
            Err(err) => {
                writer.fail(io::Error::other(err));
                return;
            }
        };

        buf.clear();
        let attempt = async {
            let response =
                request_range(&ctx.client, &target, start, end, RequestMode::CacheFleet, &cancel)
                    .await?;
            read_range_into(
                &ctx.client,
                &target,
                start,
                end,
                RequestMode::CacheFleet,
                0,
                Some(response),
                &mut buf,
                &cancel,
            )
            .await
        }
        .await;

        match attempt {
            Ok(()) => {
                writer.deliver(buf);
                return;
            }
            Err(err) if is_bucket_fallback(&err) => {
                warn!(bucket, %host, slice, error = %err, "cache bucket failed, trying next");
                previous.push(bucket);
            }
            Err(err) => {
                writer.fail(io::Error::other(err));
                return;
            }
        }
    }
}
