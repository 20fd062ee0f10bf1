//! Default fetch strategy: parallel range requests against one host
//!
//! The first request doubles as size discovery: it asks for the first
//! chunk with a range header and reads the total from `Content-Range`
//! (or `Content-Length` on a plain 200). Remaining chunks are scheduled
//! high-priority against the post-redirect URL and delivered through the
//! ordered reader sequence.

use crate::pool::{BufferPool, PooledBuf};
use crate::reader::{ChunkWriter, chunk_pipe};
use crate::rewrite::{is_cacheable, rewrite_to_cache_host};
use crate::sequence::ReaderSequence;
use crate::strategy::{Fetched, Strategy};
use crate::queue::WorkQueue;
use crate::{DownloadOptions, Error, Result};
use async_trait::async_trait;
use pget_client::{HttpClient, RequestMode};
use reqwest::Response;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Where a request is actually sent, after any cache rewrite
#[derive(Debug, Clone)]
pub(crate) struct RequestTarget {
    pub url: String,
    pub host_header: Option<String>,
}

impl RequestTarget {
    pub fn plain(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            host_header: None,
        }
    }
}

/// Size and identity learned from the discovery response
#[derive(Debug, Clone)]
pub(crate) struct FileInfo {
    pub size: u64,
    pub content_type: Option<String>,
    /// Post-redirect URL used for every subsequent range request
    pub final_url: String,
}

/// The default strategy: parallel fixed-size range requests
#[derive(Debug, Clone)]
pub struct BufferMode {
    client: HttpClient,
    queue: WorkQueue,
    pool: BufferPool,
    options: Arc<DownloadOptions>,
}

impl BufferMode {
    /// Create a strategy with its own client, queue, and buffer pool
    pub fn new(options: Arc<DownloadOptions>) -> Result<Self> {
        options.validate()?;
        let client = HttpClient::new(options.client.clone())?;
        let queue = WorkQueue::new(options.max_concurrency);
        let pool = BufferPool::new(options.max_concurrency, options.chunk_size as usize);
        Ok(Self {
            client,
            queue,
            pool,
            options,
        })
    }

    pub(crate) fn client(&self) -> &HttpClient {
        &self.client
    }

    pub(crate) fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Apply the single-cache-host URL rewrite when configured.
    ///
    /// Only a one-element host list qualifies; a larger list belongs to
    /// the consistent-hashing strategy.
    fn request_target(&self, url: &Url) -> Result<RequestTarget> {
        if let [host] = self.options.cache_hosts.as_slice() {
            if !host.is_empty() && is_cacheable(&self.options.cacheable_uri_prefixes, url) {
                let rewritten = rewrite_to_cache_host(
                    url,
                    host,
                    self.options.cache_use_path_proxy,
                    url.scheme(),
                )?;
                debug!(origin = %url, cache = %rewritten.url, "rewriting to cache host");
                return Ok(RequestTarget {
                    url: rewritten.url,
                    host_header: rewritten.host_header,
                });
            }
        }
        Ok(RequestTarget::plain(url.as_str()))
    }

    /// Issue one ranged request against the origin and deliver the bytes
    /// to `writer`. Used by the consistent-hashing strategy when a chunk
    /// has exhausted every cache bucket.
    pub(crate) async fn fill_from_origin(
        &self,
        url: &str,
        start: u64,
        end: u64,
        writer: ChunkWriter,
        cancel: CancellationToken,
    ) {
        let target = RequestTarget::plain(url);
        fill_chunk(
            self.client.clone(),
            self.pool.clone(),
            target,
            start,
            end,
            self.options.client.max_retries,
            writer,
            cancel,
        )
        .await;
    }
}

#[async_trait]
impl Strategy for BufferMode {
    async fn fetch(&self, url: &str, cancel: CancellationToken) -> Result<Fetched> {
        let parsed = Url::parse(url).map_err(|_| Error::invalid_url(url))?;
        let target = self.request_target(&parsed)?;
        let chunk_size = self.options.chunk_size;

        let (readers_tx, readers_rx) = mpsc::unbounded_channel();
        let (info_tx, info_rx) = oneshot::channel();
        let (first_writer, first_reader) = chunk_pipe();
        let _ = readers_tx.send(first_reader);

        {
            let client = self.client.clone();
            let pool = self.pool.clone();
            let target = target.clone();
            let max_resumes = self.options.client.max_retries;
            let cancel = cancel.clone();
            self.queue.submit_low(async move {
                discover_and_fill(
                    client,
                    pool,
                    target,
                    chunk_size,
                    max_resumes,
                    info_tx,
                    first_writer,
                    cancel,
                )
                .await;
            });
        }

        let info = match info_rx.await {
            Ok(Ok(info)) => info,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::Cancelled),
        };
        debug!(url, size = info.size, "discovered file size");

        for chunk in crate::plan::chunk_plan(info.size, chunk_size)
            .into_iter()
            .skip(1)
        {
            let (writer, reader) = chunk_pipe();
            let _ = readers_tx.send(reader);
            let client = self.client.clone();
            let pool = self.pool.clone();
            let target = RequestTarget {
                url: info.final_url.clone(),
                host_header: target.host_header.clone(),
            };
            let max_resumes = self.options.client.max_retries;
            let cancel = cancel.clone();
            self.queue.submit_high(async move {
                fill_chunk(
                    client,
                    pool,
                    target,
                    chunk.start,
                    chunk.end,
                    max_resumes,
                    writer,
                    cancel,
                )
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

/// First request of a file: learn the size, then keep the body
async fn discover_and_fill(
    client: HttpClient,
    pool: BufferPool,
    target: RequestTarget,
    chunk_size: u64,
    max_resumes: u32,
    info_tx: oneshot::Sender<Result<FileInfo>>,
    writer: ChunkWriter,
    cancel: CancellationToken,
) {
    let response = match request_range(
        &client,
        &target,
        0,
        chunk_size - 1,
        RequestMode::Standard,
        &cancel,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => {
            fail_both(info_tx, writer, err);
            return;
        }
    };

    let info = match parse_file_info(&response) {
        Ok(info) => info,
        Err(err) => {
            fail_both(info_tx, writer, err);
            return;
        }
    };
    let _ = info_tx.send(Ok(info.clone()));

    let mut buf = pool.checkout().await;
    if info.size == 0 {
        writer.deliver(buf);
        return;
    }

    let end = info.size.min(chunk_size) - 1;
    let target = RequestTarget {
        url: info.final_url,
        host_header: target.host_header,
    };
    match read_range_into(
        &client,
        &target,
        0,
        end,
        RequestMode::Standard,
        max_resumes,
        Some(response),
        &mut buf,
        &cancel,
    )
    .await
    {
        Ok(()) => writer.deliver(buf),
        Err(err) => writer.fail(io::Error::other(err)),
    }
}

/// Fill one chunk with its own request, resuming short bodies
#[allow(clippy::too_many_arguments)]
pub(crate) async fn fill_chunk(
    client: HttpClient,
    pool: BufferPool,
    target: RequestTarget,
    start: u64,
    end: u64,
    max_resumes: u32,
    writer: ChunkWriter,
    cancel: CancellationToken,
) {
    let mut buf = pool.checkout().await;
    match read_range_into(
        &client,
        &target,
        start,
        end,
        RequestMode::Standard,
        max_resumes,
        None,
        &mut buf,
        &cancel,
    )
    .await
    {
        Ok(()) => writer.deliver(buf),
        Err(err) => writer.fail(io::Error::other(err)),
    }
}

fn fail_both(info_tx: oneshot::Sender<Result<FileInfo>>, writer: ChunkWriter, err: Error) {
    writer.fail(io::Error::other(err.to_string()));
    let _ = info_tx.send(Err(err));
}

/// Issue one ranged request, subject to cancellation
pub(crate) async fn request_range(
    client: &HttpClient,
    target: &RequestTarget,
    start: u64,
    end: u64,
    mode: RequestMode,
    cancel: &CancellationToken,
) -> Result<Response> {
    let range = format!("bytes={start}-{end}");
    let mut headers: Vec<(&str, &str)> = vec![("Range", range.as_str())];
    if let Some(host) = &target.host_header {
        headers.push(("Host", host.as_str()));
    }
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = client.get_with_headers(&target.url, &headers, mode) => {
            result.map_err(Error::from)
        }
    }
}

/// Read the range `[start, end]` into `buf`, re-requesting from the
/// current offset whenever the body comes up short.
///
/// Resume only applies in [`RequestMode::Standard`]; against a cache
/// fleet a short or failed body means the bucket is bad and the caller
/// rehashes instead.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn read_range_into(
    client: &HttpClient,
    target: &RequestTarget,
    start: u64,
    end: u64,
    mode: RequestMode,
    max_resumes: u32,
    mut response: Option<Response>,
    buf: &mut PooledBuf,
    cancel: &CancellationToken,
) -> Result<()> {
    let expected = end - start + 1;
    let capacity = buf.capacity() as u64;
    if expected > capacity {
        return Err(Error::ChunkTooLarge {
            length: expected,
            capacity,
        });
    }

    let mut resumes = 0u32;
    loop {
        let current = match response.take() {
            Some(existing) => existing,
            None => {
                let from = start + buf.len() as u64;
                request_range(client, target, from, end, mode, cancel).await?
            }
        };

        if let Some(announced) = current.content_length() {
            if buf.len() as u64 + announced > capacity {
                return Err(Error::ChunkTooLarge {
                    length: buf.len() as u64 + announced,
                    capacity,
                });
            }
        }

        read_body_into(current, buf, mode, cancel).await?;

        let received = buf.len() as u64;
        if received >= expected {
            if received > expected {
                return Err(Error::SizeMismatch {
                    expected,
                    actual: received,
                });
            }
            return Ok(());
        }

        resumes += 1;
        if mode != RequestMode::Standard || resumes > max_resumes {
            return Err(Error::SizeMismatch {
                expected,
                actual: received,
            });
        }
        debug!(
            url = %target.url,
            start,
            end,
            received,
            "body ended early, resuming range"
        );
    }
}

/// Drain one response body into `buf`.
///
/// In standard mode a mid-body transport error is swallowed so the
/// caller can resume from the bytes already received; in fleet mode it
/// propagates as a fallback-class error.
async fn read_body_into(
    mut response: Response,
    buf: &mut PooledBuf,
    mode: RequestMode,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            chunk = response.chunk() => chunk,
        };
        match next {
            Ok(Some(bytes)) => {
                if buf.len() + bytes.len() > buf.capacity() {
                    return Err(Error::ChunkTooLarge {
                        length: (buf.len() + bytes.len()) as u64,
                        capacity: buf.capacity() as u64,
                    });
                }
                buf.extend_from_slice(&bytes);
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                if mode == RequestMode::Standard {
                    warn!(error = %err, "body read failed, treating as short read");
                    return Ok(());
                }
                return Err(Error::Client(pget_client::Error::from(err)));
            }
        }
    }
}

/// Pull size, content type, and the post-redirect URL out of the
/// discovery response. `Content-Range`'s total wins; a plain `200 OK`
/// falls back to `Content-Length`.
pub(crate) fn parse_file_info(response: &Response) -> Result<FileInfo> {
    let url = response.url().to_string();
    let size = match response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        Some(value) => {
            parse_content_range_total(value).ok_or_else(|| Error::MissingContentLength {
                url: url.clone(),
            })?
        }
        None if response.status() == reqwest::StatusCode::OK => response
            .content_length()
            .ok_or_else(|| Error::MissingContentLength { url: url.clone() })?,
        None => return Err(Error::MissingContentLength { url }),
    };
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    Ok(FileInfo {
        size,
        content_type,
        final_url: url,
    })
}

/// Extract the total from `bytes a-b/TOTAL`
fn parse_content_range_total(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes ")?
        .split('/')
        .nth(1)?
        .parse()
        .ok()
}
