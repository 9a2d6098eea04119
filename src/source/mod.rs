//! Seekable blob sources
//!
//! A [`SeekableSource`] serves an arbitrary, validated set of byte ranges of
//! one blob. Chunks may be fetched in parallel, but results are delivered
//! through [`ChunkStreams`] strictly in request order, exactly one outcome
//! (a stream or an error) per requested chunk.

pub mod file;
pub mod memory;
pub mod registry;

use std::future::Future;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blob::{BlobInfo, BlobStream};
use crate::chunk::{self, Chunk};
use crate::{Error, Result};

pub use file::FileSource;
pub use memory::MemorySource;
pub use registry::{ImageRef, RegistrySource};

/// Default number of chunk fetches a source keeps in flight.
pub const DEFAULT_CHUNK_CONCURRENCY: usize = 4;

/// A source that can serve byte ranges of a blob.
#[async_trait]
pub trait SeekableSource: Send + Sync {
    /// Start fetching `chunks` of the blob described by `info`.
    ///
    /// The chunk set must be non-empty, sorted by offset and non-overlapping;
    /// otherwise [`Error::BadPartialRequest`] is returned before any I/O.
    async fn get_blob_at(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        chunks: &[Chunk],
    ) -> Result<ChunkStreams>;
}

/// The readable content of one requested chunk.
pub struct ChunkStream {
    pub chunk: Chunk,
    pub reader: BlobStream,
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("chunk", &self.chunk)
            .finish_non_exhaustive()
    }
}

/// Ordered per-chunk results of a [`SeekableSource::get_blob_at`] call.
///
/// Dropping this stops the producer; streams not yet received are released.
pub struct ChunkStreams {
    rx: mpsc::Receiver<Result<ChunkStream>>,
    expected: usize,
    received: usize,
}

impl std::fmt::Debug for ChunkStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStreams")
            .field("expected", &self.expected)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl ChunkStreams {
    /// Number of chunks requested.
    pub fn len(&self) -> usize {
        self.expected
    }

    pub fn is_empty(&self) -> bool {
        self.expected == 0
    }

    /// The outcome for the next chunk in request order, or `None` once every
    /// chunk has been accounted for.
    ///
    /// A producer that stops early still yields one error per missing chunk.
    pub async fn next(&mut self) -> Option<Result<ChunkStream>> {
        if self.received >= self.expected {
            return None;
        }
        self.received += 1;
        match self.rx.recv().await {
            Some(item) => Some(item),
            None => Some(Err(Error::Source(
                "source stopped before delivering every chunk".to_string(),
            ))),
        }
    }
}

/// Validate `chunks` for a blob of (possibly unknown) `size`.
pub fn check_request(chunks: &[Chunk], size: Option<u64>) -> Result<()> {
    chunk::validate(chunks, size)?;
    Ok(())
}

/// Run `fetch` for each chunk with up to `concurrency` fetches in flight and
/// deliver the results in request order.
///
/// On cancellation every chunk not yet delivered resolves to
/// [`Error::Cancelled`].
pub fn spawn_ordered<F, Fut>(
    cancel: CancellationToken,
    chunks: Vec<Chunk>,
    concurrency: usize,
    fetch: F,
) -> ChunkStreams
where
    F: Fn(Chunk) -> Fut + Send + 'static,
    Fut: Future<Output = Result<BlobStream>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let expected = chunks.len();
    let (tx, rx) = mpsc::channel(concurrency);

    tokio::spawn(async move {
        let mut remaining = chunks.len();
        let mut results = futures_util::stream::iter(chunks)
            .map(move |c| {
                let fut = fetch(c);
                async move { fut.await.map(|reader| ChunkStream { chunk: c, reader }) }
            })
            .buffered(concurrency);

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(remaining, "chunk fetch cancelled");
                    for _ in 0..remaining {
                        if tx.send(Err(Error::Cancelled)).await.is_err() {
                            break;
                        }
                    }
                    return;
                }
                _ = tx.closed() => return,
                item = results.next() => item,
            };

            let Some(item) = item else { return };
            remaining -= 1;
            if tx.send(item).await.is_err() {
                return;
            }
        }
    });

    ChunkStreams {
        rx,
        expected,
        received: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn reader(data: Vec<u8>) -> BlobStream {
        Box::pin(std::io::Cursor::new(data))
    }

    #[tokio::test]
    async fn delivery_follows_request_order() {
        let chunks = vec![Chunk::new(0, 1), Chunk::new(1, 1), Chunk::new(2, 1)];
        // Earlier chunks finish last.
        let mut streams = spawn_ordered(CancellationToken::new(), chunks, 3, |c| async move {
            tokio::time::sleep(Duration::from_millis(30 - c.offset * 10)).await;
            Ok(reader(vec![c.offset as u8]))
        });

        let mut seen = Vec::new();
        while let Some(item) = streams.next().await {
            let mut s = item.unwrap();
            let mut buf = Vec::new();
            s.reader.read_to_end(&mut buf).await.unwrap();
            seen.push((s.chunk.offset, buf[0]));
        }
        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn errors_take_the_failed_chunks_slot() {
        let chunks = vec![Chunk::new(0, 1), Chunk::new(1, 1), Chunk::new(2, 1)];
        let mut streams = spawn_ordered(CancellationToken::new(), chunks, 2, |c| async move {
            if c.offset == 1 {
                Err(Error::Source("boom".into()))
            } else {
                Ok(reader(vec![0]))
            }
        });

        assert!(streams.next().await.unwrap().is_ok());
        assert!(matches!(streams.next().await, Some(Err(Error::Source(_)))));
        assert!(streams.next().await.unwrap().is_ok());
        assert!(streams.next().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_resolves_remaining_chunks() {
        let cancel = CancellationToken::new();
        let chunks = vec![Chunk::new(0, 1), Chunk::new(1, 1)];
        let mut streams = spawn_ordered(cancel.clone(), chunks, 1, |_| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(reader(vec![]))
        });
        cancel.cancel();

        assert!(matches!(streams.next().await, Some(Err(Error::Cancelled))));
        assert!(matches!(streams.next().await, Some(Err(Error::Cancelled))));
        assert!(streams.next().await.is_none());
    }
}
