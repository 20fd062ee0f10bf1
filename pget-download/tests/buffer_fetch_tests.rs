//! Integration tests for the buffer-mode strategy

mod common;

use common::{RangeResponder, parse_range, patterned_body};
use pget_client::ClientOptions;
use pget_download::{BufferMode, DownloadOptions, Strategy};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn options(chunk_size: u64, concurrency: usize) -> Arc<DownloadOptions> {
    Arc::new(DownloadOptions {
        chunk_size,
        max_concurrency: concurrency,
        client: ClientOptions {
            max_retries: 2,
            retry_min: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
            ..ClientOptions::default()
        },
        ..DownloadOptions::default()
    })
}

async fn fetch_all(strategy: &BufferMode, url: &str) -> (Vec<u8>, u64) {
    let fetched = strategy
        .fetch(url, CancellationToken::new())
        .await
        .expect("fetch");
    let size = fetched.size;
    let mut reader = fetched.reader;
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.expect("read");
    (out, size)
}

#[tokio::test]
async fn small_file_arrives_in_one_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello.txt"))
        .respond_with(RangeResponder::new(&b"hello, world!"[..]))
        .mount(&server)
        .await;

    let strategy = BufferMode::new(options(1024 * 1024, 4)).expect("strategy");
    let (out, size) = fetch_all(&strategy, &format!("{}/hello.txt", server.uri())).await;

    assert_eq!(size, 13);
    assert_eq!(out, b"hello, world!");
}

#[tokio::test]
async fn large_file_reassembles_byte_identical() {
    let body = patterned_body(256 * 1024);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    // 256 KiB in 32 KiB chunks: 8 range requests.
    let strategy = BufferMode::new(options(32 * 1024, 8)).expect("strategy");
    let (out, size) = fetch_all(&strategy, &format!("{}/blob", server.uri())).await;

    assert_eq!(size, body.len() as u64);
    assert_eq!(out, body, "reassembled bytes must be identical");

    let requests = server.received_requests().await.expect("requests");
    assert_eq!(requests.len(), 8, "one request per chunk");

    // Requests tile the file in offset terms, whatever their order.
    let mut ranges: Vec<(u64, u64)> = requests.iter().filter_map(parse_range).collect();
    ranges.sort_unstable();
    assert_eq!(ranges[0].0, 0);
    for pair in ranges.windows(2) {
        assert_eq!(pair[0].1 + 1, pair[1].0);
    }
}

#[tokio::test]
async fn content_length_on_plain_200_is_accepted() {
    // A server that ignores Range and sends the whole body.
    let body = b"entire file in one go".to_vec();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plain"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let strategy = BufferMode::new(options(1024, 2)).expect("strategy");
    let (out, size) = fetch_all(&strategy, &format!("{}/plain", server.uri())).await;

    assert_eq!(size, body.len() as u64);
    assert_eq!(out, body);
}

#[tokio::test]
async fn short_body_resumes_from_offset() {
    // The server closes each ranged response early; the producer must
    // re-request from the last received byte until the chunk is whole.
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .and(header("Range", "bytes=0-9"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-4/13")
                .set_body_bytes(&b"hello"[..]),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .and(header("Range", "bytes=5-9"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 5-9/13")
                .set_body_bytes(&b", wor"[..]),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .and(header("Range", "bytes=10-12"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 10-12/13")
                .set_body_bytes(&b"ld!"[..]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let strategy = BufferMode::new(options(10, 2)).expect("strategy");
    let (out, size) = fetch_all(&strategy, &format!("{}/flaky", server.uri())).await;

    assert_eq!(size, 13);
    assert_eq!(out, b"hello, world!");
}

#[tokio::test]
async fn assembly_is_exact_across_size_and_chunk_combinations() {
    // Awkward divisions on purpose: chunk == size, chunk > size,
    // one-byte chunks, and remainders.
    let server = MockServer::start().await;
    let sizes = [1usize, 2, 3, 5, 13, 64, 100];
    for size in sizes {
        Mock::given(method("GET"))
            .and(path(format!("/blob-{size}")))
            .respond_with(RangeResponder::new(patterned_body(size)))
            .mount(&server)
            .await;
    }

    for chunk_size in [1u64, 3, 7, 64, 128] {
        let strategy = BufferMode::new(options(chunk_size, 4)).expect("strategy");
        for size in sizes {
            let (out, reported) =
                fetch_all(&strategy, &format!("{}/blob-{size}", server.uri())).await;
            assert_eq!(reported, size as u64, "size for chunk_size={chunk_size}");
            assert_eq!(
                out,
                patterned_body(size),
                "bytes for size={size} chunk_size={chunk_size}"
            );
        }
    }
}

#[tokio::test]
async fn not_found_fails_the_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let strategy = BufferMode::new(options(1024, 2)).expect("strategy");
    let err = strategy
        .fetch(&format!("{}/gone", server.uri()), CancellationToken::new())
        .await
        .expect_err("404 is fatal");
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn single_cache_host_rewrites_the_url() {
    let cache = MockServer::start().await;
    let body = b"served from the cache".to_vec();
    Mock::given(method("GET"))
        .and(path("/models/llama"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&cache)
        .await;

    let mut opts = DownloadOptions {
        chunk_size: 1024,
        max_concurrency: 2,
        cache_hosts: vec![common::host_of(&cache.uri())],
        ..DownloadOptions::default()
    };
    opts.cacheable_uri_prefixes
        .insert("origin.example.com".to_string(), vec![]);
    opts.client.retry_min = Duration::from_millis(5);
    opts.client.retry_max = Duration::from_millis(20);

    let strategy = BufferMode::new(Arc::new(opts)).expect("strategy");
    // The origin host does not exist; only the rewrite can succeed.
    let (out, _) = fetch_all(&strategy, "http://origin.example.com/models/llama").await;
    assert_eq!(out, body);
}

#[tokio::test]
async fn cancellation_aborts_the_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            RangeResponderDelay::new(patterned_body(64 * 1024), Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let strategy = BufferMode::new(options(16 * 1024, 2)).expect("strategy");
    let cancel = CancellationToken::new();
    let url = format!("{}/slow", server.uri());
    let fetch = strategy.fetch(&url, cancel.clone());
    cancel.cancel();

    match fetch.await {
        Err(err) => assert!(err.to_string().contains("cancelled")),
        Ok(fetched) => {
            // Discovery may have won the race; the stream must then fail.
            let mut reader = fetched.reader;
            let mut out = Vec::new();
            reader
                .read_to_end(&mut out)
                .await
                .expect_err("stream must observe cancellation");
        }
    }
}

/// RangeResponder that also stalls each response
struct RangeResponderDelay {
    inner: RangeResponder,
    delay: Duration,
}

impl RangeResponderDelay {
    fn new(body: Vec<u8>, delay: Duration) -> Self {
        Self {
            inner: RangeResponder::new(body),
            delay,
        }
    }
}

impl wiremock::Respond for RangeResponderDelay {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        self.inner.respond(request).set_delay(self.delay)
    }
}
