use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::digest::Digest;

/// A readable byte stream for blob content.
pub type BlobStream = Pin<Box<dyn AsyncRead + Send>>;

/// Metadata about a blob: identity, size and media type.
///
/// Two values with the same digest denote the same content even when their
/// size metadata disagrees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Content-addressable digest (e.g. "sha256:abcdef…").
    pub digest: Digest,
    /// Size in bytes; `None` when not yet known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// OCI media type (e.g. "application/vnd.oci.image.layer.v1.tar+gzip").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl BlobInfo {
    pub fn new(digest: Digest) -> Self {
        Self {
            digest,
            size: None,
            media_type: None,
        }
    }

    /// Describe an in-memory blob, computing its SHA-256 digest and size.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::new(Digest::sha256(data)).with_size(data.len() as u64)
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Replace size metadata with the verified byte count.
    ///
    /// Returns `true` when the previous value was unknown or different.
    pub fn reconcile_size(&mut self, verified: u64) -> bool {
        let changed = self.size != Some(verified);
        self.size = Some(verified);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_prefers_verified_size() {
        let mut info = BlobInfo::of_bytes(b"abc");
        assert!(!info.reconcile_size(3));

        let mut unknown = BlobInfo::new(info.digest.clone());
        assert!(unknown.reconcile_size(3));
        assert_eq!(unknown.size, Some(3));

        info.size = Some(99);
        assert!(info.reconcile_size(3));
        assert_eq!(info.size, Some(3));
    }
}
