//! Integration tests for the consistent-hashing strategy

mod common;

use common::{RangeResponder, host_of, parse_range};
use pget_client::ClientOptions;
use pget_download::hash::{CacheKey, bucket_for, structural_hash};
use pget_download::{ConsistentHashing, DownloadOptions, Strategy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const ORIGIN_URL: &str = "http://origin.example.com/data";

fn fleet_options(
    cache_hosts: Vec<String>,
    chunk_size: u64,
    slice_size: u64,
) -> Arc<DownloadOptions> {
    fleet_options_for("origin.example.com", cache_hosts, chunk_size, slice_size)
}

fn fleet_options_for(
    cacheable_host: &str,
    cache_hosts: Vec<String>,
    chunk_size: u64,
    slice_size: u64,
) -> Arc<DownloadOptions> {
    let mut prefixes = HashMap::new();
    prefixes.insert(cacheable_host.to_string(), vec![]);
    Arc::new(DownloadOptions {
        chunk_size,
        slice_size,
        max_concurrency: 4,
        cache_hosts,
        cacheable_uri_prefixes: prefixes,
        client: ClientOptions {
            max_retries: 1,
            retry_min: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
            ..ClientOptions::default()
        },
        ..DownloadOptions::default()
    })
}

async fn fetch_all(strategy: &ConsistentHashing, url: &str) -> Vec<u8> {
    let fetched = strategy
        .fetch(url, CancellationToken::new())
        .await
        .expect("fetch");
    let mut reader = fetched.reader;
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.expect("read");
    out
}

/// Start one cache node serving `digit` repeated `len` times
async fn digit_server(digit: u8, len: usize) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder::new(vec![digit; len]))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn slices_route_to_hashed_buckets() {
    // Eight cache nodes, each serving a distinct repeated digit; with
    // 3-byte slices and 1-byte chunks every output byte names the bucket
    // that served it, which must match the public hash function.
    let mut servers = Vec::new();
    let mut hosts = Vec::new();
    for i in 0u8..8 {
        let server = digit_server(b'0' + i, 16).await;
        hosts.push(host_of(&server.uri()));
        servers.push(server);
    }

    let strategy = ConsistentHashing::new(fleet_options(hosts, 1, 3)).expect("strategy");
    let out = fetch_all(&strategy, ORIGIN_URL).await;

    assert_eq!(out.len(), 16);
    let expected: Vec<u8> = (0..16u64)
        .map(|offset| {
            let key = structural_hash(&CacheKey {
                url: ORIGIN_URL,
                slice_index: offset / 3,
            });
            b'0' + bucket_for(key, 8, &[]) as u8
        })
        .collect();
    assert_eq!(out, expected, "every byte must come from its hashed bucket");

    // More than one node must have been involved for this layout.
    let distinct: std::collections::HashSet<u8> = out.iter().copied().collect();
    assert!(distinct.len() > 1, "slices should spread across the fleet");
}

#[tokio::test]
async fn empty_bucket_reroutes_to_distinct_nodes() {
    // Same fleet with slot 0 marked unavailable: every slice that would
    // hash to bucket 0 must re-route to a distinct live bucket.
    let mut servers = Vec::new();
    let mut hosts = vec![String::new()];
    for i in 1u8..8 {
        let server = digit_server(b'0' + i, 16).await;
        hosts.push(host_of(&server.uri()));
        servers.push(server);
    }

    let strategy = ConsistentHashing::new(fleet_options(hosts, 1, 3)).expect("strategy");
    let out = fetch_all(&strategy, ORIGIN_URL).await;

    let expected: Vec<u8> = (0..16u64)
        .map(|offset| {
            let key = structural_hash(&CacheKey {
                url: ORIGIN_URL,
                slice_index: offset / 3,
            });
            let mut bucket = bucket_for(key, 8, &[]);
            if bucket == 0 {
                bucket = bucket_for(key, 8, &[0]);
            }
            b'0' + bucket as u8
        })
        .collect();
    assert_eq!(out, expected);
    assert!(
        !out.contains(&b'0'),
        "no byte may be served by the empty bucket"
    );
}

/// Serves a body but 502s one specific range
struct PoisonedRange {
    inner: RangeResponder,
    poisoned: (u64, u64),
}

impl Respond for PoisonedRange {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if parse_range(request) == Some(self.poisoned) {
            return ResponseTemplate::new(502);
        }
        self.inner.respond(request)
    }
}

#[tokio::test]
async fn failing_chunk_falls_back_to_origin_exactly_once() {
    let body = b"abcdefghi".to_vec();

    // The cache serves everything except bytes 3-5, which it 502s.
    let cache = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(PoisonedRange {
            inner: RangeResponder::new(body.clone()),
            poisoned: (3, 5),
        })
        .mount(&cache)
        .await;

    // Origin only ever sees the poisoned chunk.
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder::new(body.clone()))
        .expect(1)
        .mount(&origin)
        .await;

    // One live bucket plus one empty slot keeps the fleet active while
    // making bucket exhaustion immediate for the failing chunk.
    let hosts = vec![host_of(&cache.uri()), String::new()];
    let options = fleet_options_for("127.0.0.1", hosts, 3, 3);
    let strategy = ConsistentHashing::new(options).expect("strategy");

    let origin_uri = format!("{}/data", origin.uri());
    let out = fetch_all(&strategy, &origin_uri).await;
    assert_eq!(out, body, "stream must heal through origin fallback");

    let origin_requests = origin.received_requests().await.expect("requests");
    assert_eq!(origin_requests.len(), 1, "origin serves exactly one chunk");
    assert_eq!(parse_range(&origin_requests[0]), Some((3, 5)));
}

#[tokio::test]
async fn first_chunk_exhaustion_refetches_whole_file_from_origin() {
    // Both cache slots are dead; the very first chunk exhausts the
    // buckets and the whole file is fetched in buffer mode instead.
    let origin = MockServer::start().await;
    let body = b"origin wins".to_vec();
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&origin)
        .await;

    let hosts = vec![String::new(), String::new()];
    let strategy =
        ConsistentHashing::new(fleet_options_for("127.0.0.1", hosts, 4, 4)).expect("strategy");

    let origin_uri = format!("{}/data", origin.uri());
    let out = fetch_all(&strategy, &origin_uri).await;
    assert_eq!(out, body);
}

#[tokio::test]
async fn non_cacheable_url_uses_buffer_mode() {
    let origin = MockServer::start().await;
    let body = b"not cacheable".to_vec();
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&origin)
        .await;

    // Cache hosts exist but the origin host has no cacheable prefix.
    let mut options = fleet_options(
        vec!["unused-1.internal".to_string(), "unused-2.internal".to_string()],
        64,
        64,
    );
    Arc::get_mut(&mut options)
        .expect("sole owner")
        .cacheable_uri_prefixes
        .clear();

    let strategy = ConsistentHashing::new(options).expect("strategy");
    let origin_uri = format!("{}/data", origin.uri());
    let out = fetch_all(&strategy, &origin_uri).await;
    assert_eq!(out, body);
}

#[tokio::test]
async fn path_proxy_mode_prefixes_origin_host() {
    // In path-proxy mode the cache sees /origin-host/path and the Host
    // header carries the origin.
    let cache = MockServer::start().await;
    let body = b"proxied".to_vec();
    Mock::given(method("GET"))
        .and(path("/origin.example.com/data"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&cache)
        .await;

    let host = host_of(&cache.uri());
    let mut options = fleet_options(vec![host.clone(), host], 64, 64);
    Arc::get_mut(&mut options).expect("sole owner").cache_use_path_proxy = true;

    let strategy = ConsistentHashing::new(options).expect("strategy");
    let out = fetch_all(&strategy, ORIGIN_URL).await;
    assert_eq!(out, body);
}
