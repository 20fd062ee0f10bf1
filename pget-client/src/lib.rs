//! Range-capable HTTP transport for pget
//!
//! This crate wraps `reqwest` with the transport behavior the download
//! engine relies on:
//!
//! - Retry with jittered linear backoff, honoring `Retry-After` on 429
//! - Outcome classification for cache-fleet fallback (dial/read errors
//!   and 502/503 are surfaced to the caller instead of retried)
//! - DNS overrides consulted at dial time
//! - Redirect following with debug logging of each hop
//! - Optional forced HTTP/2 and per-host connection caps
//!
//! # Example
//!
//! ```no_run
//! use pget_client::{ClientOptions, HttpClient, RequestMode};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new(ClientOptions::default())?;
//! let response = client
//!     .get_range("https://example.com/weights.bin", 0, 1023, RequestMode::Standard)
//!     .await?;
//! let body = response.bytes().await?;
//! println!("fetched {} bytes", body.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod client;
mod error;

pub use client::{ClientOptions, HttpClient, RequestMode};
pub use error::{Error, Result};
