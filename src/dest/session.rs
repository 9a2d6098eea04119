//! One image copy into a [`DirectoryStore`].
//!
//! A session routes layer writes through a [`LayerCommitCoordinator`] so
//! parallel workers commit each layer index once, and records the resulting
//! layer chain when the copy finishes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    partial, DirectoryStore, ImageDestination, ImageDestinationPartial, PutBlobOptions,
    TryReusingBlobOptions,
};
use crate::blob::{BlobInfo, BlobStream};
use crate::cache::{BlobInfoCache, BlobLocation};
use crate::commit::{ChainLink, LayerCommitCoordinator};
use crate::source::SeekableSource;
use crate::{Error, Result};

const MODE_UNSET: u8 = 0;
const MODE_OPTIONS: u8 = 1;
const MODE_PLAIN: u8 = 2;

fn mode_name(mode: u8) -> &'static str {
    match mode {
        MODE_OPTIONS => "options-based",
        MODE_PLAIN => "plain",
        _ => "unset",
    }
}

pub struct DestinationSession {
    id: Uuid,
    store: Arc<DirectoryStore>,
    commits: LayerCommitCoordinator,
    mode: AtomicU8,
}

impl DestinationSession {
    pub fn new(store: Arc<DirectoryStore>) -> Self {
        let id = Uuid::now_v7();
        debug!(session = %id, root = %store.root().display(), "opened destination session");
        Self {
            id,
            store,
            commits: LayerCommitCoordinator::new(),
            mode: AtomicU8::new(MODE_UNSET),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Arc<DirectoryStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &LayerCommitCoordinator {
        &self.commits
    }

    /// Directory holding this session's metadata.
    pub fn dir(&self) -> PathBuf {
        self.store.sessions_dir().join(self.id.to_string())
    }

    /// Lock the session into one calling mode; switching later is misuse.
    fn enter(&self, mode: u8) -> Result<()> {
        match self
            .mode
            .compare_exchange(MODE_UNSET, mode, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == mode => Ok(()),
            Err(current) => Err(Error::Misuse(format!(
                "{} call on a session already used with {} calls",
                mode_name(mode),
                mode_name(current)
            ))),
        }
    }

    async fn store_stream(
        &self,
        cancel: &CancellationToken,
        stream: BlobStream,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<BlobInfo> {
        let stored = self.store.put_blob(cancel, stream, info).await?;
        cache.record_known_location(&stored.digest, self.store.location());
        Ok(stored)
    }

    /// Find `info` locally or through cached locations in other stores.
    async fn reuse(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
        can_substitute: bool,
        scope: Option<&str>,
    ) -> Result<Option<BlobInfo>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(found) = self.store.stat(&info.digest).await? {
            debug!(digest = %info.digest, "blob already in store");
            cache.record_known_location(&info.digest, self.store.location());
            return Ok(Some(adopt(info, found, false)));
        }

        for candidate in cache.candidate_locations(&info.digest, scope, can_substitute) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(root) = local_root(&candidate.location) else {
                debug!(digest = %candidate.digest, scope = %candidate.location.scope, "skipping non-local location");
                continue;
            };
            match self.store.link_from(cancel, root, &candidate.digest).await {
                Ok(Some(found)) => {
                    info!(
                        digest = %candidate.digest,
                        from = %root.display(),
                        substitute = candidate.substitute,
                        "reused blob from cached location"
                    );
                    cache.record_known_location(&candidate.digest, self.store.location());
                    return Ok(Some(adopt(info, found, candidate.substitute)));
                }
                Ok(None) => debug!(
                    digest = %candidate.digest,
                    from = %root.display(),
                    "stale cached location"
                ),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(
                    digest = %candidate.digest,
                    from = %root.display(),
                    error = %e,
                    "failed to reuse cached location"
                ),
            }
        }

        if can_substitute {
            if let Some(uncompressed) = cache.uncompressed_digest(&info.digest) {
                let mut others = cache.digests_with_uncompressed(&uncompressed);
                others.push(uncompressed);
                for other in others.iter().filter(|d| **d != info.digest) {
                    if let Some(found) = self.store.stat(other).await? {
                        debug!(digest = %info.digest, substitute = %other, "substitute already in store");
                        return Ok(Some(adopt(info, found, true)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Partial pull of a layer, committed through the coordinator when
    /// `options.layer_index` is set.
    pub async fn put_blob_partial_with_options(
        &self,
        cancel: &CancellationToken,
        source: &dyn SeekableSource,
        src_info: &BlobInfo,
        options: PutBlobOptions,
    ) -> Result<BlobInfo> {
        self.enter(MODE_OPTIONS)?;
        check_put_options(&options)?;

        let cache = options.cache.as_ref();
        let Some(index) = options.layer_index else {
            if options.empty_layer {
                return Ok(src_info.clone());
            }
            return self.store.put_blob_partial(cancel, source, src_info, cache).await;
        };

        let empty = options.empty_layer;
        // A partial pull that cannot start never claims the index.
        if !empty && !self.store.has_blob(&src_info.digest).await? {
            partial::partial_size(src_info)?;
        }
        self.commits
            .commit(cancel, index, &src_info.digest, empty, || async move {
                if empty {
                    return Ok(src_info.clone());
                }
                self.store
                    .put_blob_partial(cancel, source, src_info, cache)
                    .await
            })
            .await
    }

    /// Close the session after `expected_layers` layers.
    ///
    /// Fails if any index in `0..expected_layers` is not committed; otherwise
    /// writes the layer chain to `sessions/<id>/layers.json` and returns it.
    pub async fn finish(&self, expected_layers: usize) -> Result<Vec<ChainLink>> {
        let missing = self.commits.uncommitted(expected_layers);
        if !missing.is_empty() {
            return Err(Error::Incomplete(format!(
                "layers {missing:?} of {expected_layers} not committed"
            )));
        }

        let chain = self.commits.layer_chain();
        let dir = self.dir();
        fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(&chain)?;
        fs::write(dir.join("layers.json"), json).await?;

        info!(
            session = %self.id,
            layers = chain.len(),
            chain_id = ?chain.last().and_then(|l| l.chain_id.as_ref()).map(|d| d.to_string()),
            "session finished"
        );
        Ok(chain)
    }
}

fn check_put_options(options: &PutBlobOptions) -> Result<()> {
    if options.is_config && options.layer_index.is_some() {
        return Err(Error::InvalidOptions(
            "a config blob cannot carry a layer index".to_string(),
        ));
    }
    if options.is_config && options.empty_layer {
        return Err(Error::InvalidOptions(
            "a config blob cannot be an empty layer".to_string(),
        ));
    }
    Ok(())
}

/// Root of the directory store a cache location points at, if it is one
/// on this host.
///
/// Stores record themselves as `dir:<root>`; a location scoped to a
/// repository still counts when its locator is an absolute path.
fn local_root(location: &BlobLocation) -> Option<&Path> {
    let root = Path::new(&location.locator);
    (location.scope.starts_with("dir:") || root.is_absolute()).then_some(root)
}

/// Descriptor returned for a reused blob. A substitute keeps only what the
/// store knows about it.
fn adopt(requested: &BlobInfo, found: BlobInfo, substitute: bool) -> BlobInfo {
    if substitute {
        return found;
    }
    BlobInfo {
        media_type: requested.media_type.clone(),
        ..found
    }
}

#[async_trait]
impl ImageDestination for DestinationSession {
    async fn put_blob(
        &self,
        cancel: &CancellationToken,
        stream: BlobStream,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
        is_config: bool,
    ) -> Result<BlobInfo> {
        self.enter(MODE_PLAIN)?;
        let stored = self.store_stream(cancel, stream, info, cache).await?;
        debug!(digest = %stored.digest, is_config, "stored blob");
        Ok(adopt(info, stored, false))
    }

    async fn try_reusing_blob(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
        can_substitute: bool,
    ) -> Result<Option<BlobInfo>> {
        self.enter(MODE_PLAIN)?;
        self.reuse(cancel, info, cache, can_substitute, None).await
    }

    async fn put_blob_with_options(
        &self,
        cancel: &CancellationToken,
        stream: BlobStream,
        info: &BlobInfo,
        options: PutBlobOptions,
    ) -> Result<BlobInfo> {
        self.enter(MODE_OPTIONS)?;
        check_put_options(&options)?;

        let cache = options.cache.as_ref();
        let Some(index) = options.layer_index else {
            if options.empty_layer {
                return Ok(info.clone());
            }
            let stored = self.store_stream(cancel, stream, info, cache).await?;
            return Ok(adopt(info, stored, false));
        };

        let empty = options.empty_layer;
        self.commits
            .commit(cancel, index, &info.digest, empty, || async move {
                if empty {
                    debug!(layer = index, digest = %info.digest, "empty layer; nothing to transfer");
                    return Ok(info.clone());
                }
                let stored = self.store_stream(cancel, stream, info, cache).await?;
                Ok(adopt(info, stored, false))
            })
            .await
    }

    async fn try_reusing_blob_with_options(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        options: TryReusingBlobOptions,
    ) -> Result<Option<BlobInfo>> {
        self.enter(MODE_OPTIONS)?;

        let cache = options.cache.as_ref();
        let scope = options.src_ref.as_ref().map(|r| r.scope());
        let scope = scope.as_deref();

        let Some(index) = options.layer_index else {
            if options.empty_layer {
                return Ok(Some(info.clone()));
            }
            return self
                .reuse(cancel, info, cache, options.can_substitute, scope)
                .await;
        };

        if options.empty_layer {
            return self
                .commits
                .commit(cancel, index, &info.digest, true, || async { Ok(info.clone()) })
                .await
                .map(Some);
        }

        if let Some(existing) = self.commits.join(cancel, index, &info.digest).await? {
            return Ok(Some(existing));
        }

        let Some(reused) = self
            .reuse(cancel, info, cache, options.can_substitute, scope)
            .await?
        else {
            return Ok(None);
        };
        self.commits
            .commit(cancel, index, &info.digest, false, || async move { Ok(reused) })
            .await
            .map(Some)
    }
}

/// Partial pulls do not commit a layer index, so they are allowed in either
/// calling mode.
#[async_trait]
impl ImageDestinationPartial for DestinationSession {
    async fn put_blob_partial(
        &self,
        cancel: &CancellationToken,
        source: &dyn SeekableSource,
        src_info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<BlobInfo> {
        self.store
            .put_blob_partial(cancel, source, src_info, cache)
            .await
    }
}
