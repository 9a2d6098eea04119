//! Byte ranges within a blob and the rules for requesting them.
//!
//! A chunk set handed to a [`SeekableSource`](crate::source::SeekableSource)
//! must be non-empty, sorted by offset and non-overlapping. The helpers here
//! validate such sets and compute the coalesced complement of what a
//! destination already holds.

use serde::{Deserialize, Serialize};

use crate::error::BadPartialRequestError;

/// A contiguous byte range `[offset, offset + length)` of one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
}

impl Chunk {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Chunk covering `[start, end)`.
    pub fn from_range(start: u64, end: u64) -> Self {
        Self {
            offset: start,
            length: end.saturating_sub(start),
        }
    }

    /// Exclusive end offset. Saturates instead of overflowing; sets with
    /// overflowing chunks are rejected by [`validate`].
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Inclusive HTTP `Range` header value, e.g. `bytes=0-99`. An empty
    /// chunk has no such value.
    pub fn http_range(&self) -> Option<String> {
        if self.length == 0 {
            return None;
        }
        Some(format!("bytes={}-{}", self.offset, self.end() - 1))
    }
}

/// Check a requested chunk set against the source contract.
///
/// When `blob_size` is known, chunks reaching past the end are rejected too.
pub fn validate(chunks: &[Chunk], blob_size: Option<u64>) -> Result<(), BadPartialRequestError> {
    if chunks.is_empty() {
        return Err(BadPartialRequestError::new("empty chunk set"));
    }

    let mut prev_end: Option<u64> = None;
    for (i, c) in chunks.iter().enumerate() {
        if c.length == 0 {
            return Err(BadPartialRequestError::new(format!(
                "chunk {i} at offset {} is empty",
                c.offset
            )));
        }
        let end = c.offset.checked_add(c.length).ok_or_else(|| {
            BadPartialRequestError::new(format!("chunk {i} overflows the offset space"))
        })?;
        if let Some(prev) = prev_end {
            if c.offset < prev {
                return Err(BadPartialRequestError::new(format!(
                    "chunk {i} at offset {} overlaps or precedes the previous chunk ending at {prev}",
                    c.offset
                )));
            }
        }
        if let Some(size) = blob_size {
            if end > size {
                return Err(BadPartialRequestError::new(format!(
                    "chunk {i} [{}, {end}) exceeds blob size {size}",
                    c.offset
                )));
            }
        }
        prev_end = Some(end);
    }
    Ok(())
}

/// Sort and merge overlapping or adjacent ranges; empty chunks are dropped.
pub fn coalesce(chunks: &[Chunk]) -> Vec<Chunk> {
    let mut sorted: Vec<Chunk> = chunks.iter().copied().filter(|c| c.length > 0).collect();
    sorted.sort_by_key(|c| c.offset);

    let mut out: Vec<Chunk> = Vec::with_capacity(sorted.len());
    for c in sorted {
        match out.last_mut() {
            Some(last) if c.offset <= last.end() => {
                let end = last.end().max(c.end());
                last.length = end - last.offset;
            }
            _ => out.push(c),
        }
    }
    out
}

/// Ranges of `[0, total)` not covered by `present`, sorted and coalesced.
pub fn missing(present: &[Chunk], total: u64) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut cursor = 0u64;
    for c in coalesce(present) {
        if c.offset >= total {
            break;
        }
        if c.offset > cursor {
            out.push(Chunk::from_range(cursor, c.offset));
        }
        cursor = cursor.max(c.end());
    }
    if cursor < total {
        out.push(Chunk::from_range(cursor, total));
    }
    out
}

/// Total number of bytes covered by a coalesced set.
pub fn covered_len(chunks: &[Chunk]) -> u64 {
    coalesce(chunks).iter().map(|c| c.length).sum()
}
