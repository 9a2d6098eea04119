//! Partial (chunked) pulls into a [`DirectoryStore`].
//!
//! Bytes land in a staging file under `partial/`; a JSON ledger next to it
//! records the ranges already written so an interrupted pull can resume by
//! requesting only the complement. The blob moves under `blobs/` only after
//! the assembled file hashes to the expected digest.

use std::io::SeekFrom;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::DirectoryStore;
use crate::blob::BlobInfo;
use crate::cache::BlobInfoCache;
use crate::chunk::{self, Chunk};
use crate::digest::{self, Digest};
use crate::source::SeekableSource;
use crate::{Error, Result};

/// Byte ranges of a staging file known to hold source content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeLedger {
    pub size: u64,
    pub chunks: Vec<Chunk>,
}

impl RangeLedger {
    fn new(size: u64) -> Self {
        Self {
            size,
            chunks: Vec::new(),
        }
    }

    fn add(&mut self, c: Chunk) {
        self.chunks.push(c);
        self.chunks = chunk::coalesce(&self.chunks);
    }

    pub fn missing(&self) -> Vec<Chunk> {
        chunk::missing(&self.chunks, self.size)
    }
}

impl DirectoryStore {
    /// Ranges already written for an in-progress partial pull of `digest`.
    pub async fn partial_ranges(&self, digest: &Digest) -> Result<Option<RangeLedger>> {
        if !fs::try_exists(self.partial_path(digest)).await? {
            return Ok(None);
        }
        match fs::read(self.ledger_path(digest)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Digests with an in-progress partial pull.
    pub async fn list_partials(&self) -> Result<Vec<(Digest, RangeLedger)>> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(self.root().join("partial")).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".ranges.json") else {
                continue;
            };
            let Some((algo, hex)) = stem.split_once('-') else {
                continue;
            };
            let Ok(digest) = Digest::parse(&format!("{algo}:{hex}")) else {
                continue;
            };
            if let Some(ledger) = self.partial_ranges(&digest).await? {
                out.push((digest, ledger));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Materialize `src_info` by fetching only the ranges not yet present.
    ///
    /// No request reaches `source` when the blob (or every byte of it) is
    /// already held. Chunk or write failures fail the call without retry;
    /// ranges written before the failure stay recorded for a later resume.
    /// A digest mismatch discards the staging state.
    pub async fn put_blob_partial(
        &self,
        cancel: &CancellationToken,
        source: &dyn SeekableSource,
        src_info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<BlobInfo> {
        let digest = &src_info.digest;

        if let Some(existing) = self.stat(digest).await? {
            debug!(%digest, "blob already present; skipping partial pull");
            return Ok(merge_info(src_info, existing));
        }

        let size = partial_size(src_info)?;

        let lock = self.partial_lock(digest);
        let _guard = lock.lock().await;

        // Another writer may have finished while we waited.
        if let Some(existing) = self.stat(digest).await? {
            return Ok(merge_info(src_info, existing));
        }

        let mut ledger = match self.partial_ranges(digest).await? {
            Some(l) if l.size == size => l,
            Some(l) => {
                warn!(%digest, recorded = l.size, size, "size changed; restarting partial pull");
                RangeLedger::new(size)
            }
            None => RangeLedger::new(size),
        };
        let missing = ledger.missing();

        let staging = self.partial_path(digest);
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&staging)
            .await?;
        file.set_len(size).await?;

        if missing.is_empty() {
            debug!(%digest, "all ranges present; verifying");
        } else {
            info!(
                %digest,
                chunks = missing.len(),
                bytes = missing.iter().map(|c| c.length).sum::<u64>(),
                "fetching missing ranges",
            );
            let mut streams = source.get_blob_at(cancel, src_info, &missing).await?;

            while let Some(item) = streams.next().await {
                let mut cs = item?;
                file.seek(SeekFrom::Start(cs.chunk.offset)).await?;
                let mut limited = (&mut cs.reader).take(cs.chunk.length);
                let copied = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    r = tokio::io::copy(&mut limited, &mut file) => r?,
                };
                if copied != cs.chunk.length {
                    return Err(Error::Source(format!(
                        "short chunk at offset {}: expected {} bytes, got {}",
                        cs.chunk.offset, cs.chunk.length, copied
                    )));
                }
                let mut extra = [0u8; 1];
                if cs.reader.read(&mut extra).await? != 0 {
                    return Err(Error::Source(format!(
                        "chunk at offset {} is longer than {} bytes",
                        cs.chunk.offset, cs.chunk.length
                    )));
                }
                file.flush().await?;
                self.add_bytes_written(copied);
                ledger.add(cs.chunk);
                self.save_ledger(digest, &ledger).await?;
            }
        }
        file.sync_all().await?;
        drop(file);

        let actual = digest::digest_file(&staging, digest.algorithm()).await?;
        if let Err(e) = digest::verify(digest, &actual) {
            warn!(%digest, %actual, "assembled blob failed verification; discarding");
            self.discard_partial(digest).await;
            return Err(e);
        }

        self.commit_file(&staging, digest).await?;
        let _ = fs::remove_file(self.ledger_path(digest)).await;
        cache.record_known_location(digest, self.location());

        info!(%digest, size, "partial pull complete");
        let mut out = src_info.clone();
        out.reconcile_size(size);
        Ok(out)
    }

    async fn save_ledger(&self, digest: &Digest, ledger: &RangeLedger) -> Result<()> {
        let path = self.ledger_path(digest);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(ledger)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn discard_partial(&self, digest: &Digest) {
        for path in [self.partial_path(digest), self.ledger_path(digest)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove partial state");
                }
            }
        }
    }
}

/// Size of `info` if a partial pull can handle it: known and non-zero.
pub(crate) fn partial_size(info: &BlobInfo) -> Result<u64> {
    match info.size {
        None => Err(Error::PartialUnsupported(format!(
            "{}: size unknown",
            info.digest
        ))),
        Some(0) => Err(Error::PartialUnsupported(format!(
            "{}: empty blob",
            info.digest
        ))),
        Some(size) => Ok(size),
    }
}

fn merge_info(requested: &BlobInfo, existing: BlobInfo) -> BlobInfo {
    let mut out = requested.clone();
    if let Some(size) = existing.size {
        out.reconcile_size(size);
    }
    out
}
