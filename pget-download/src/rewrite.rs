//! Cache URL rewriting and cacheable-prefix matching

use crate::{Error, Result};
use std::collections::HashMap;
use url::Url;

/// A request retargeted at a cache node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenRequest {
    /// The URL to actually dial
    pub url: String,
    /// `Host` header override, set in path-proxy mode so the origin
    /// identity survives the rewrite
    pub host_header: Option<String>,
}

/// Whether a URL is eligible for the cache tier.
///
/// The host must appear in the prefix map; an empty prefix list admits
/// the whole host, otherwise the URL path must start with one of the
/// configured prefixes.
pub fn is_cacheable(prefixes: &HashMap<String, Vec<String>>, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    match prefixes.get(host) {
        None => false,
        Some(list) => list.is_empty() || list.iter().any(|p| url.path().starts_with(p.as_str())),
    }
}

/// Retarget `url` at `cache_host`, keeping path and query.
///
/// Host mode maps `scheme://origin/path?q` to `scheme://cache/path?q`;
/// path-proxy mode maps it to `scheme://cache/<origin-host>/path?q` with
/// the `Host` header preserving the origin. `cache_host` may carry an
/// explicit port.
pub fn rewrite_to_cache_host(
    url: &Url,
    cache_host: &str,
    path_proxy: bool,
    scheme: &str,
) -> Result<RewrittenRequest> {
    let origin_host = url
        .host_str()
        .ok_or_else(|| Error::invalid_url(url.as_str()))?
        .to_ascii_lowercase();

    let (host, port) = match cache_host.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::config(format!("invalid cache host: {cache_host}")))?;
            (h, Some(port))
        }
        None => (cache_host, None),
    };

    let mut rewritten = url.clone();
    rewritten
        .set_scheme(scheme)
        .map_err(|()| Error::invalid_url(url.as_str()))?;
    rewritten
        .set_host(Some(host))
        .map_err(|_| Error::config(format!("invalid cache host: {cache_host}")))?;
    rewritten
        .set_port(port)
        .map_err(|()| Error::config(format!("invalid cache host: {cache_host}")))?;

    let host_header = if path_proxy {
        let path = format!("/{}{}", origin_host, url.path());
        rewritten.set_path(&path);
        Some(origin_host)
    } else {
        None
    };

    Ok(RewrittenRequest {
        url: rewritten.to_string(),
        host_header,
    })
}
