//! Blob identity cache
//!
//! Records where blobs are known to live so a destination can recognise
//! content it already has (or can cheaply link) without transferring it.
//! The cache is advisory: implementations never surface errors to callers,
//! and every consumer keeps a transfer-from-scratch fallback.

pub mod disk;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

pub use disk::DiskBlobInfoCache;
pub use memory::MemoryBlobInfoCache;

/// A place a blob is known to exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocation {
    /// Repository (`registry/repository`) or local store the location
    /// belongs to.
    pub scope: String,
    /// Transport-specific address, e.g. a store root or registry host.
    pub locator: String,
}

impl BlobLocation {
    pub fn new(scope: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            locator: locator.into(),
        }
    }
}

/// A reuse candidate: a digest (possibly a substitute) and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub digest: Digest,
    pub location: BlobLocation,
    /// `true` when `digest` differs from the requested one but shares its
    /// uncompressed content.
    pub substitute: bool,
}

/// Concurrent, best-effort map from blob digests to known locations.
///
/// `known_locations` returns locations most-recently-recorded first.
pub trait BlobInfoCache: Send + Sync {
    /// Remember that `digest` exists at `location`. Never fails.
    fn record_known_location(&self, digest: &Digest, location: BlobLocation);

    /// Locations recorded for `digest`; empty on a miss.
    fn known_locations(&self, digest: &Digest) -> Vec<BlobLocation>;

    /// Remember that `any` (possibly compressed) decompresses to
    /// `uncompressed`.
    fn record_digest_uncompressed_pair(&self, any: &Digest, uncompressed: &Digest);

    /// The uncompressed digest for `any`, if known. An uncompressed blob maps
    /// to itself once recorded.
    fn uncompressed_digest(&self, any: &Digest) -> Option<Digest>;

    /// Every digest recorded as decompressing to `uncompressed`.
    fn digests_with_uncompressed(&self, uncompressed: &Digest) -> Vec<Digest>;

    /// Reuse candidates for `digest`.
    ///
    /// Exact-digest locations come first. With `can_substitute`, locations
    /// of digests sharing the same uncompressed content follow. Within each
    /// group, locations in `scope` are listed before the rest.
    fn candidate_locations(
        &self,
        digest: &Digest,
        scope: Option<&str>,
        can_substitute: bool,
    ) -> Vec<Candidate> {
        let mut out = scoped_first(digest, self.known_locations(digest), scope, false);

        if can_substitute {
            if let Some(uncompressed) = self.uncompressed_digest(digest) {
                let mut others = self.digests_with_uncompressed(&uncompressed);
                if !others.contains(&uncompressed) {
                    others.push(uncompressed);
                }
                for other in others.into_iter().filter(|d| d != digest) {
                    let locations = self.known_locations(&other);
                    out.extend(scoped_first(&other, locations, scope, true));
                }
            }
        }
        out
    }
}

fn scoped_first(
    digest: &Digest,
    locations: Vec<BlobLocation>,
    scope: Option<&str>,
    substitute: bool,
) -> Vec<Candidate> {
    let (mut first, rest): (Vec<_>, Vec<_>) = locations
        .into_iter()
        .partition(|l| scope.is_some_and(|s| l.scope == s));
    first.extend(rest);
    first
        .into_iter()
        .map(|location| Candidate {
            digest: digest.clone(),
            location,
            substitute,
        })
        .collect()
}

/// A cache that remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl BlobInfoCache for NoCache {
    fn record_known_location(&self, _digest: &Digest, _location: BlobLocation) {}

    fn known_locations(&self, _digest: &Digest) -> Vec<BlobLocation> {
        Vec::new()
    }

    fn record_digest_uncompressed_pair(&self, _any: &Digest, _uncompressed: &Digest) {}

    fn uncompressed_digest(&self, _any: &Digest) -> Option<Digest> {
        None
    }

    fn digests_with_uncompressed(&self, _uncompressed: &Digest) -> Vec<Digest> {
        Vec::new()
    }
}
