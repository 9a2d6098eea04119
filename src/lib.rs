//! blobxfer: blob transfer core for container image copies
//!
//! Moves content-addressed blobs from a source into a local directory store,
//! fetching only the byte ranges a destination is missing and committing
//! every layer of an image exactly once when layers are copied in parallel.
//!
//! # Key Pieces
//!
//! - **Blob identity and cache**: [`Digest`], [`BlobInfo`] and a
//!   [`cache::BlobInfoCache`] of where blobs were seen before
//! - **Seekable sources**: [`source::SeekableSource`] streams requested
//!   chunks of a blob, in request order
//! - **Partial destination**: [`dest::DirectoryStore`] assembles a blob from
//!   missing ranges and verifies it before it becomes visible
//! - **Layer commits**: [`commit::LayerCommitCoordinator`] and
//!   [`dest::DestinationSession`] give each layer index one commit
//!
//! # Example: Partial Pull
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use blobxfer::cache::MemoryBlobInfoCache;
//! use blobxfer::dest::DirectoryStore;
//! use blobxfer::source::FileSource;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let upstream = DirectoryStore::new("/srv/upstream");
//!     let digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".parse()?;
//!     let info = upstream.stat(&digest).await?.ok_or("blob not found")?;
//!
//!     let store = Arc::new(DirectoryStore::new("/var/lib/blobxfer"));
//!     let source = FileSource::from_store(upstream.root());
//!     let cache = MemoryBlobInfoCache::new();
//!
//!     let stored = store
//!         .put_blob_partial(&CancellationToken::new(), &source, &info, &cache)
//!         .await?;
//!     println!("stored {} ({:?} bytes)", stored.digest, stored.size);
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod cache;
pub mod chunk;
pub mod commit;
pub mod config;
pub mod dest;
pub mod digest;
pub mod error;
pub mod source;

// Re-exports for convenience
pub use blob::{BlobInfo, BlobStream};
pub use chunk::Chunk;
pub use digest::Digest;
pub use error::{Error, Result};

// Prelude for common imports
pub mod prelude {
    pub use crate::blob::{BlobInfo, BlobStream};
    pub use crate::cache::{BlobInfoCache, DiskBlobInfoCache, MemoryBlobInfoCache, NoCache};
    pub use crate::chunk::Chunk;
    pub use crate::commit::{ChainLink, LayerCommitCoordinator, LayerStatus};
    pub use crate::config::TransferConfig;
    pub use crate::dest::{
        DestinationSession, DirectoryStore, ImageDestination, ImageDestinationPartial,
        PutBlobOptions, TryReusingBlobOptions,
    };
    pub use crate::digest::Digest;
    pub use crate::error::{Error, Result};
    pub use crate::source::{ChunkStreams, SeekableSource};
}
