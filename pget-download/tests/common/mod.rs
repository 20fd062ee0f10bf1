//! Shared wiremock helpers for download tests

#![allow(dead_code)]

use wiremock::{Request, Respond, ResponseTemplate};

/// Serves a fixed body honoring `Range: bytes=a-b` headers the way an
/// object store does: `206` with `Content-Range`, cropped to the body.
pub struct RangeResponder {
    body: Vec<u8>,
}

impl RangeResponder {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into() }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        match parse_range(request) {
            Some((start, end)) => {
                if start >= total {
                    return ResponseTemplate::new(416);
                }
                let end = end.min(total - 1);
                ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {start}-{end}/{total}").as_str(),
                    )
                    .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

/// Pull `(start, end)` out of a `Range: bytes=a-b` header
pub fn parse_range(request: &Request) -> Option<(u64, u64)> {
    let value = request.headers.get("range")?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Deterministic non-repeating test body
pub fn patterned_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

/// Strip the `http://` prefix from a wiremock URI, leaving `host:port`
pub fn host_of(uri: &str) -> String {
    uri.trim_start_matches("http://").to_string()
}
