use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{check_request, spawn_ordered, ChunkStreams, SeekableSource};
use crate::blob::{BlobInfo, BlobStream};
use crate::chunk::Chunk;
use crate::digest::Digest;
use crate::{Error, Result};

/// Serves blobs held in memory.
///
/// Every accepted request is recorded, and individual chunk offsets can be
/// set to fail, which makes it convenient for exercising destinations.
#[derive(Default)]
pub struct MemorySource {
    blobs: HashMap<Digest, Bytes>,
    failing_offsets: HashSet<u64>,
    requests: Mutex<Vec<Vec<Chunk>>>,
    concurrency: usize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            concurrency: super::DEFAULT_CHUNK_CONCURRENCY,
            ..Default::default()
        }
    }

    /// Add a blob, returning its descriptor.
    pub fn insert(&mut self, data: impl Into<Bytes>) -> BlobInfo {
        let data = data.into();
        let info = BlobInfo::of_bytes(&data);
        self.blobs.insert(info.digest.clone(), data);
        info
    }

    /// Make any chunk starting at `offset` resolve to an error.
    pub fn fail_chunk_at(mut self, offset: u64) -> Self {
        self.failing_offsets.insert(offset);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Chunk sets of every accepted `get_blob_at` call, in call order.
    pub fn requests(&self) -> Vec<Vec<Chunk>> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SeekableSource for MemorySource {
    async fn get_blob_at(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        chunks: &[Chunk],
    ) -> Result<ChunkStreams> {
        check_request(chunks, info.size)?;
        let data = self
            .blobs
            .get(&info.digest)
            .cloned()
            .ok_or_else(|| Error::NotFound(info.digest.to_string()))?;
        check_request(chunks, Some(data.len() as u64))?;

        if let Ok(mut r) = self.requests.lock() {
            r.push(chunks.to_vec());
        }

        let failing = self.failing_offsets.clone();
        Ok(spawn_ordered(
            cancel.clone(),
            chunks.to_vec(),
            self.concurrency,
            move |c| {
                let result = if failing.contains(&c.offset) {
                    Err(Error::Source(format!("injected failure at offset {}", c.offset)))
                } else {
                    let slice = data.slice(c.offset as usize..c.end() as usize);
                    Ok(Box::pin(std::io::Cursor::new(slice)) as BlobStream)
                };
                async move { result }
            },
        ))
    }
}
