//! Cache key hashing and jump-consistent bucket selection

use sha2::{Digest, Sha256};

/// Identity of a cacheable unit: one slice of one URL.
///
/// All chunks within a slice share a key and therefore a cache node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey<'a> {
    /// The origin URL being downloaded
    pub url: &'a str,
    /// Index of the slice within the file
    pub slice_index: u64,
}

/// Stable structural hash of a cache key.
///
/// Fields are folded in as `name`/`value` pairs and default-valued
/// fields are skipped entirely, so adding a new field with a zero value
/// leaves every existing hash unchanged.
pub fn structural_hash(key: &CacheKey<'_>) -> u64 {
    let mut hasher = Sha256::new();
    if !key.url.is_empty() {
        hasher.update(b"url\x1f");
        hasher.update(key.url.as_bytes());
        hasher.update(b"\x1e");
    }
    if key.slice_index != 0 {
        hasher.update(b"slice_index\x1f");
        hasher.update(key.slice_index.to_le_bytes());
        hasher.update(b"\x1e");
    }
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

/// Jump consistent hash (Lamping & Veach): maps `key` to a bucket in
/// `[0, num_buckets)` such that growing the bucket count moves only
/// `1/num_buckets` of keys.
pub fn jump_hash(mut key: u64, num_buckets: u32) -> u32 {
    assert!(num_buckets > 0, "need at least one bucket");
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(num_buckets) {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = (((b + 1) as f64) * ((1u64 << 31) as f64 / (((key >> 33) + 1) as f64))) as i64;
    }
    b as u32
}

/// Pick a bucket for `key_hash` among `buckets`, never returning any
/// index in `previous`.
///
/// The jump is computed over the reduced bucket count and the result is
/// advanced past each excluded index in ascending order, which keeps the
/// minimal-movement property intact under retries.
///
/// # Panics
///
/// Panics if every bucket is excluded; callers check for exhaustion
/// first.
pub fn bucket_for(key_hash: u64, buckets: usize, previous: &[usize]) -> usize {
    assert!(
        previous.len() < buckets,
        "all buckets excluded, nothing to choose"
    );
    let mut excluded = previous.to_vec();
    excluded.sort_unstable();
    let mut bucket = jump_hash(key_hash, (buckets - excluded.len()) as u32) as usize;
    for skip in excluded {
        if bucket >= skip {
            bucket += 1;
        }
    }
    bucket
}
