use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{BlobInfoCache, BlobLocation};
use crate::digest::Digest;

/// In-process cache shared by every transfer in the process.
///
/// Updates are last-write-wins; re-recording a location only refreshes its
/// recency.
#[derive(Debug, Default)]
pub struct MemoryBlobInfoCache {
    inner: RwLock<CacheState>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct CacheState {
    seq: u64,
    locations: HashMap<Digest, Vec<(BlobLocation, u64)>>,
    uncompressed: HashMap<Digest, Digest>,
}

/// Serializable form of the cache contents.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    #[serde(default)]
    pub locations: Vec<SnapshotLocation>,
    #[serde(default)]
    pub uncompressed: Vec<(Digest, Digest)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotLocation {
    pub digest: Digest,
    pub location: BlobLocation,
    pub seq: u64,
}

impl MemoryBlobInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = CacheState::default();
        for entry in snapshot.locations {
            state.seq = state.seq.max(entry.seq);
            state
                .locations
                .entry(entry.digest)
                .or_default()
                .push((entry.location, entry.seq));
        }
        state.uncompressed = snapshot.uncompressed.into_iter().collect();
        Self {
            inner: RwLock::new(state),
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let Ok(state) = self.inner.read() else {
            warn!("blob info cache lock poisoned; snapshot is empty");
            return Snapshot::default();
        };
        let mut locations: Vec<SnapshotLocation> = state
            .locations
            .iter()
            .flat_map(|(digest, locs)| {
                locs.iter().map(move |(location, seq)| SnapshotLocation {
                    digest: digest.clone(),
                    location: location.clone(),
                    seq: *seq,
                })
            })
            .collect();
        locations.sort_by_key(|l| l.seq);
        let mut uncompressed: Vec<(Digest, Digest)> = state
            .uncompressed
            .iter()
            .map(|(a, u)| (a.clone(), u.clone()))
            .collect();
        uncompressed.sort();
        Snapshot {
            locations,
            uncompressed,
        }
    }
}

impl BlobInfoCache for MemoryBlobInfoCache {
    fn record_known_location(&self, digest: &Digest, location: BlobLocation) {
        let Ok(mut state) = self.inner.write() else {
            warn!(%digest, "blob info cache lock poisoned; dropping location");
            return;
        };
        state.seq += 1;
        let seq = state.seq;
        let entries = state.locations.entry(digest.clone()).or_default();
        match entries.iter_mut().find(|(l, _)| *l == location) {
            Some(existing) => existing.1 = seq,
            None => entries.push((location, seq)),
        }
    }

    fn known_locations(&self, digest: &Digest) -> Vec<BlobLocation> {
        let Ok(state) = self.inner.read() else {
            return Vec::new();
        };
        let mut entries = state.locations.get(digest).cloned().unwrap_or_default();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().map(|(l, _)| l).collect()
    }

    fn record_digest_uncompressed_pair(&self, any: &Digest, uncompressed: &Digest) {
        let Ok(mut state) = self.inner.write() else {
            warn!(%any, "blob info cache lock poisoned; dropping digest pair");
            return;
        };
        if let Some(previous) = state.uncompressed.insert(any.clone(), uncompressed.clone()) {
            if previous != *uncompressed {
                warn!(
                    %any,
                    %previous,
                    %uncompressed,
                    "uncompressed digest changed for blob",
                );
            }
        }
        state
            .uncompressed
            .insert(uncompressed.clone(), uncompressed.clone());
    }

    fn uncompressed_digest(&self, any: &Digest) -> Option<Digest> {
        self.inner.read().ok()?.uncompressed.get(any).cloned()
    }

    fn digests_with_uncompressed(&self, uncompressed: &Digest) -> Vec<Digest> {
        let Ok(state) = self.inner.read() else {
            return Vec::new();
        };
        let mut out: Vec<Digest> = state
            .uncompressed
            .iter()
            .filter(|(_, u)| *u == uncompressed)
            .map(|(a, _)| a.clone())
            .collect();
        out.sort();
        out
    }
}
