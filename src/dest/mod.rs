//! Image destinations
//!
//! A destination receives blobs either as whole streams or, when it also
//! implements [`ImageDestinationPartial`], by pulling only missing ranges
//! from a [`SeekableSource`].

pub mod partial;
pub mod session;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::blob::{BlobInfo, BlobStream};
use crate::cache::{BlobInfoCache, NoCache};
use crate::source::{ImageRef, SeekableSource};
use crate::Result;

pub use partial::RangeLedger;
pub use session::DestinationSession;
pub use store::{DirectoryStore, StoreStats};

/// Per-call options for [`ImageDestination::put_blob_with_options`].
#[derive(Clone)]
pub struct PutBlobOptions {
    pub cache: Arc<dyn BlobInfoCache>,
    /// The blob is the image config, not a layer.
    pub is_config: bool,
    /// The layer is empty; no content needs to move.
    pub empty_layer: bool,
    /// Position in the image's layer list, when the blob is a layer.
    pub layer_index: Option<usize>,
}

impl PutBlobOptions {
    pub fn new(cache: Arc<dyn BlobInfoCache>) -> Self {
        Self {
            cache,
            is_config: false,
            empty_layer: false,
            layer_index: None,
        }
    }

    pub fn layer(mut self, index: usize) -> Self {
        self.layer_index = Some(index);
        self
    }

    pub fn config(mut self) -> Self {
        self.is_config = true;
        self
    }

    pub fn empty(mut self, empty: bool) -> Self {
        self.empty_layer = empty;
        self
    }
}

impl Default for PutBlobOptions {
    fn default() -> Self {
        Self::new(Arc::new(NoCache))
    }
}

/// Per-call options for [`ImageDestination::try_reusing_blob_with_options`].
#[derive(Clone)]
pub struct TryReusingBlobOptions {
    pub cache: Arc<dyn BlobInfoCache>,
    /// Accept a different digest with the same uncompressed content.
    pub can_substitute: bool,
    pub empty_layer: bool,
    pub layer_index: Option<usize>,
    /// Where the blob is being copied from; its repository is preferred
    /// when ranking cached locations.
    pub src_ref: Option<ImageRef>,
}

impl TryReusingBlobOptions {
    pub fn new(cache: Arc<dyn BlobInfoCache>) -> Self {
        Self {
            cache,
            can_substitute: false,
            empty_layer: false,
            layer_index: None,
            src_ref: None,
        }
    }

    pub fn layer(mut self, index: usize) -> Self {
        self.layer_index = Some(index);
        self
    }

    pub fn substitute(mut self, can_substitute: bool) -> Self {
        self.can_substitute = can_substitute;
        self
    }

    pub fn empty(mut self, empty: bool) -> Self {
        self.empty_layer = empty;
        self
    }

    pub fn from_ref(mut self, src_ref: ImageRef) -> Self {
        self.src_ref = Some(src_ref);
        self
    }
}

impl Default for TryReusingBlobOptions {
    fn default() -> Self {
        Self::new(Arc::new(NoCache))
    }
}

/// Write side of an image copy.
///
/// The plain calls and the `_with_options` calls are two modes of use; an
/// implementation may refuse to mix them on one instance.
#[async_trait]
pub trait ImageDestination: Send + Sync {
    /// Store a whole blob from `stream`, verifying it against `info.digest`.
    async fn put_blob(
        &self,
        cancel: &CancellationToken,
        stream: BlobStream,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
        is_config: bool,
    ) -> Result<BlobInfo>;

    /// Make `info` available without transferring it, if possible.
    ///
    /// `Ok(None)` means the blob could not be reused and must be put.
    async fn try_reusing_blob(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
        can_substitute: bool,
    ) -> Result<Option<BlobInfo>>;

    async fn put_blob_with_options(
        &self,
        cancel: &CancellationToken,
        stream: BlobStream,
        info: &BlobInfo,
        options: PutBlobOptions,
    ) -> Result<BlobInfo>;

    async fn try_reusing_blob_with_options(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        options: TryReusingBlobOptions,
    ) -> Result<Option<BlobInfo>>;
}

/// Destinations that can assemble a blob from ranges of a seekable source.
#[async_trait]
pub trait ImageDestinationPartial: Send + Sync {
    async fn put_blob_partial(
        &self,
        cancel: &CancellationToken,
        source: &dyn SeekableSource,
        src_info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<BlobInfo>;
}

#[async_trait]
impl ImageDestinationPartial for DirectoryStore {
    async fn put_blob_partial(
        &self,
        cancel: &CancellationToken,
        source: &dyn SeekableSource,
        src_info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<BlobInfo> {
        DirectoryStore::put_blob_partial(self, cancel, source, src_info, cache).await
    }
}
