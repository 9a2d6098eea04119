use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::blob::{BlobInfo, BlobStream};
use crate::cache::BlobLocation;
use crate::digest::{self, Digest};
use crate::{Error, Result};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Path of `digest` in a directory store rooted at `root`:
/// `<root>/blobs/<algorithm>/<hex>`.
pub fn blob_path_in(root: &Path, digest: &Digest) -> PathBuf {
    root.join("blobs")
        .join(digest.algorithm().as_str())
        .join(digest.hex())
}

/// Counters for bytes and blobs made final in a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub blobs_committed: u64,
    pub bytes_written: u64,
}

/// Content-addressed blob store on local disk.
///
/// Layout under the root:
/// - `blobs/<algorithm>/<hex>` complete, verified blobs
/// - `partial/<algorithm>-<hex>` staging files for partial pulls, with a
///   `.ranges.json` ledger of the byte ranges already written
/// - `tmp/` scratch files for full writes
/// - `sessions/<id>/` per-image session metadata
///
/// A blob appears under `blobs/` only after its digest has been verified.
pub struct DirectoryStore {
    root: PathBuf,
    blobs_committed: AtomicU64,
    bytes_written: AtomicU64,
    partial_locks: Mutex<HashMap<Digest, Arc<tokio::sync::Mutex<()>>>>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            blobs_committed: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            partial_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        blob_path_in(&self.root, digest)
    }

    pub(crate) fn partial_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("partial").join(digest.file_stem())
    }

    pub(crate) fn ledger_path(&self, digest: &Digest) -> PathBuf {
        self.partial_path(digest).with_extension("ranges.json")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub(crate) fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Cache location naming this store.
    pub fn location(&self) -> BlobLocation {
        let root = self.root.display().to_string();
        BlobLocation::new(format!("dir:{root}"), root)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            blobs_committed: self.blobs_committed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    /// Descriptor of a complete blob, or `None` if the store lacks it.
    pub async fn stat(&self, digest: &Digest) -> Result<Option<BlobInfo>> {
        match fs::metadata(self.blob_path(digest)).await {
            Ok(m) if m.is_file() => Ok(Some(BlobInfo::new(digest.clone()).with_size(m.len()))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn has_blob(&self, digest: &Digest) -> Result<bool> {
        Ok(self.stat(digest).await?.is_some())
    }

    /// Stream `stream` into the store as `info.digest`, verifying content.
    ///
    /// The returned descriptor carries the verified size.
    pub async fn put_blob(
        &self,
        cancel: &CancellationToken,
        mut stream: BlobStream,
        info: &BlobInfo,
    ) -> Result<BlobInfo> {
        let tmp_dir = self.tmp_dir();
        fs::create_dir_all(&tmp_dir).await?;
        let tmp = tempfile::Builder::new()
            .prefix(".put-")
            .tempfile_in(&tmp_dir)?;
        let (std_file, tmp_path) = tmp.into_parts();
        let mut file = fs::File::from_std(std_file);

        let mut hasher = info.digest.hasher();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                n = stream.read(&mut buf) => n?,
            };
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let written = hasher.len();
        digest::verify(&info.digest, &hasher.finish())?;

        let mut out = info.clone();
        if out.reconcile_size(written) && info.size.is_some() {
            debug!(
                digest = %info.digest,
                declared = ?info.size,
                verified = written,
                "size metadata corrected",
            );
        }

        self.add_bytes_written(written);
        self.commit_file(&tmp_path, &info.digest).await?;
        info!(digest = %info.digest, size = written, "stored blob");
        Ok(out)
    }

    /// Make a verified file final under `blobs/`.
    pub(crate) async fn commit_file(&self, from: &Path, digest: &Digest) -> Result<()> {
        let dest = self.blob_path(digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(from, &dest).await?;
        self.blobs_committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Bring `digest` in from another directory store on this host.
    ///
    /// Hard-links when possible and falls back to a verified copy. Returns
    /// `None` when the other store does not hold the blob.
    pub async fn link_from(
        &self,
        cancel: &CancellationToken,
        other_root: &Path,
        digest: &Digest,
    ) -> Result<Option<BlobInfo>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let src = blob_path_in(other_root, digest);
        if src == self.blob_path(digest) {
            return self.stat(digest).await;
        }
        if !fs::try_exists(&src).await? {
            return Ok(None);
        }

        let dest = self.blob_path(digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::hard_link(&src, &dest).await {
            Ok(()) => {
                self.blobs_committed.fetch_add(1, Ordering::Relaxed);
                debug!(%digest, from = %src.display(), "hard-linked blob");
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                debug!(%digest, error = %e, "hard link failed; copying");
                let file = fs::File::open(&src).await?;
                let info = BlobInfo::new(digest.clone());
                self.put_blob(cancel, Box::pin(file), &info).await?;
            }
        }
        self.stat(digest).await
    }

    /// Serialize partial writers of the same digest.
    pub(crate) fn partial_lock(&self, digest: &Digest) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .partial_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(digest.clone()).or_default().clone()
    }

    /// Digests of every complete blob in the store.
    pub async fn list_blobs(&self) -> Result<Vec<BlobInfo>> {
        let mut out = Vec::new();
        let blobs = self.root.join("blobs");
        let mut algos = match fs::read_dir(&blobs).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(algo) = algos.next_entry().await? {
            let algo_name = algo.file_name().to_string_lossy().to_string();
            let mut entries = fs::read_dir(algo.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let raw = format!("{}:{}", algo_name, entry.file_name().to_string_lossy());
                if let Ok(d) = Digest::parse(&raw) {
                    let size = entry.metadata().await?.len();
                    out.push(BlobInfo::new(d).with_size(size));
                }
            }
        }
        out.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(data: &'static [u8]) -> BlobStream {
        Box::pin(data)
    }

    #[test]
    fn blob_path_layout() {
        let d = Digest::sha256(b"x");
        let p = blob_path_in(Path::new("/tmp/store"), &d);
        assert_eq!(
            p,
            PathBuf::from(format!("/tmp/store/blobs/sha256/{}", d.hex()))
        );
    }

    #[tokio::test]
    async fn put_blob_verifies_and_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());
        let info = BlobInfo::new(Digest::sha256(b"hello world"));

        assert!(!store.has_blob(&info.digest).await.unwrap());
        let out = store
            .put_blob(&CancellationToken::new(), stream(b"hello world"), &info)
            .await
            .unwrap();
        assert_eq!(out.size, Some(11));
        assert!(store.has_blob(&info.digest).await.unwrap());
        assert_eq!(
            std::fs::read(store.blob_path(&info.digest)).unwrap(),
            b"hello world"
        );
        assert_eq!(
            store.stats(),
            StoreStats {
                blobs_committed: 1,
                bytes_written: 11
            }
        );
    }

    #[tokio::test]
    async fn put_blob_rejects_wrong_content() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());
        let info = BlobInfo::new(Digest::sha256(b"expected"));

        let err = store
            .put_blob(&CancellationToken::new(), stream(b"tampered"), &info)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(!store.has_blob(&info.digest).await.unwrap());
        assert_eq!(store.stats().blobs_committed, 0);
    }

    #[tokio::test]
    async fn put_blob_honours_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());
        let info = BlobInfo::new(Digest::sha256(b"data"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store.put_blob(&cancel, stream(b"data"), &info).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!store.has_blob(&info.digest).await.unwrap());
    }

    #[tokio::test]
    async fn link_from_other_store() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = DirectoryStore::new(a.path());
        let dst = DirectoryStore::new(b.path());
        let cancel = CancellationToken::new();
        let info = BlobInfo::new(Digest::sha256(b"shared"));
        src.put_blob(&cancel, stream(b"shared"), &info).await.unwrap();

        let linked = dst.link_from(&cancel, a.path(), &info.digest).await.unwrap();
        assert_eq!(linked.unwrap().size, Some(6));
        assert!(dst.has_blob(&info.digest).await.unwrap());

        let missing = Digest::sha256(b"nope");
        assert!(dst.link_from(&cancel, a.path(), &missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn link_from_honours_cancellation() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = DirectoryStore::new(a.path());
        let dst = DirectoryStore::new(b.path());
        let info = BlobInfo::new(Digest::sha256(b"shared"));
        src.put_blob(&CancellationToken::new(), stream(b"shared"), &info)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dst
            .link_from(&cancel, a.path(), &info.digest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!dst.has_blob(&info.digest).await.unwrap());
    }

    #[tokio::test]
    async fn list_blobs_reports_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());
        assert!(store.list_blobs().await.unwrap().is_empty());

        let info = BlobInfo::new(Digest::sha256(b"one"));
        store
            .put_blob(&CancellationToken::new(), stream(b"one"), &info)
            .await
            .unwrap();
        let listed = store.list_blobs().await.unwrap();
        assert_eq!(listed, vec![info.with_size(3)]);
    }
}
