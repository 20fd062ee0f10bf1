//! Chunk and slice layout for a file of known size
//!
//! All ranges are inclusive byte offsets, matching the HTTP `Range`
//! header convention.

/// One byte range requested in a single HTTP `Range` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the ordered chunk sequence
    pub index: usize,
    /// First byte offset
    pub start: u64,
    /// Last byte offset, inclusive
    pub end: u64,
}

impl Chunk {
    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Chunks always cover at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A chunk annotated with the slice it belongs to (consistent hashing)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceChunk {
    /// Index of the owning slice; all chunks of a slice hash to the
    /// same cache bucket
    pub slice: u64,
    /// The byte range
    pub chunk: Chunk,
}

/// Fixed-size chunk layout used by buffer mode.
///
/// Chunk `i` covers `[i*chunk_size, min((i+1)*chunk_size, size)-1]`;
/// the final chunk shrinks to the remainder.
pub fn chunk_plan(size: u64, chunk_size: u64) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + chunk_size).min(size) - 1;
        chunks.push(Chunk {
            index: chunks.len(),
            start,
            end,
        });
        start = end + 1;
    }
    chunks
}

/// Split `total` into `parts` integers that sum to `total`, each either
/// `total / parts` or `total / parts + 1`. The leading parts carry the
/// remainder.
pub fn equal_split(total: u64, parts: u64) -> Vec<u64> {
    assert!(parts > 0, "parts must be positive");
    let base = total / parts;
    let remainder = total % parts;
    (0..parts)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Slice-aligned chunk layout used by consistent hashing.
///
/// The file is partitioned into `ceil(size / slice_size)` slices; within
/// each slice chunks are laid out normally (`chunk_size` bytes, final
/// chunk shrunk to the slice remainder), so no chunk ever straddles a
/// slice boundary and the leading chunk always matches the eager
/// discovery request.
pub fn slice_plan(size: u64, slice_size: u64, chunk_size: u64) -> Vec<SliceChunk> {
    assert!(slice_size > 0, "slice size must be positive");
    let chunk_size = chunk_size.min(slice_size);
    let mut out = Vec::new();
    let mut slice_start = 0;
    let mut slice = 0;
    while slice_start < size {
        let slice_end = (slice_start + slice_size).min(size) - 1;
        let mut start = slice_start;
        while start <= slice_end {
            let end = (start + chunk_size - 1).min(slice_end);
            out.push(SliceChunk {
                slice,
                chunk: Chunk {
                    index: out.len(),
                    start,
                    end,
                },
            });
            start = end + 1;
        }
        slice_start = slice_end + 1;
        slice += 1;
    }
    out
}
