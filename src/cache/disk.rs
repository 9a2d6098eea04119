use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::memory::{MemoryBlobInfoCache, Snapshot};
use super::{BlobInfoCache, BlobLocation};
use crate::digest::Digest;

/// Memory cache persisted to a JSON file after every update.
///
/// Persistence is best effort: an unreadable file opens as an empty cache
/// and write failures are logged and ignored.
pub struct DiskBlobInfoCache {
    path: PathBuf,
    memory: MemoryBlobInfoCache,
    lock: Mutex<()>,
}

impl DiskBlobInfoCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let memory = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => {
                    debug!(
                        path = %path.display(),
                        locations = snapshot.locations.len(),
                        "loaded blob info cache",
                    );
                    MemoryBlobInfoCache::from_snapshot(snapshot)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring corrupt blob info cache");
                    MemoryBlobInfoCache::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryBlobInfoCache::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read blob info cache");
                MemoryBlobInfoCache::new()
            }
        };

        Self {
            path,
            memory,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) {
        let Ok(_g) = self.lock.lock() else {
            warn!("blob info cache file lock poisoned; skipping write");
            return;
        };
        if let Err(e) = self.write_snapshot() {
            warn!(path = %self.path.display(), error = %e, "failed to persist blob info cache");
        }
    }

    fn write_snapshot(&self) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(&self.memory.snapshot())?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl BlobInfoCache for DiskBlobInfoCache {
    fn record_known_location(&self, digest: &Digest, location: BlobLocation) {
        self.memory.record_known_location(digest, location);
        self.persist();
    }

    fn known_locations(&self, digest: &Digest) -> Vec<BlobLocation> {
        self.memory.known_locations(digest)
    }

    fn record_digest_uncompressed_pair(&self, any: &Digest, uncompressed: &Digest) {
        self.memory.record_digest_uncompressed_pair(any, uncompressed);
        self.persist();
    }

    fn uncompressed_digest(&self, any: &Digest) -> Option<Digest> {
        self.memory.uncompressed_digest(any)
    }

    fn digests_with_uncompressed(&self, uncompressed: &Digest) -> Vec<Digest> {
        self.memory.digests_with_uncompressed(uncompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache").join("blobinfo.json");
        let d = Digest::sha256(b"layer");
        let raw = Digest::sha256(b"raw");

        {
            let cache = DiskBlobInfoCache::open(&path);
            cache.record_known_location(&d, BlobLocation::new("repo", "/store"));
            cache.record_digest_uncompressed_pair(&d, &raw);
        }

        let reopened = DiskBlobInfoCache::open(&path);
        assert_eq!(
            reopened.known_locations(&d),
            vec![BlobLocation::new("repo", "/store")]
        );
        assert_eq!(reopened.uncompressed_digest(&d), Some(raw));
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blobinfo.json");
        std::fs::write(&path, b"{not json").unwrap();

        let cache = DiskBlobInfoCache::open(&path);
        let d = Digest::sha256(b"x");
        assert!(cache.known_locations(&d).is_empty());

        cache.record_known_location(&d, BlobLocation::new("s", "l"));
        assert_eq!(DiskBlobInfoCache::open(&path).known_locations(&d).len(), 1);
    }

    #[test]
    fn unwritable_path_is_swallowed() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be.
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let cache = DiskBlobInfoCache::open(blocker.join("blobinfo.json"));
        let d = Digest::sha256(b"x");
        cache.record_known_location(&d, BlobLocation::new("s", "l"));
        assert_eq!(cache.known_locations(&d).len(), 1);
    }
}
