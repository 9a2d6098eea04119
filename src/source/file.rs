use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{check_request, spawn_ordered, ChunkStreams, SeekableSource};
use crate::blob::{BlobInfo, BlobStream};
use crate::chunk::Chunk;
use crate::dest::store::blob_path_in;
use crate::digest::Digest;
use crate::{Error, Result};

/// Serves byte ranges from blobs on local disk.
///
/// Blobs are looked up in a directory store laid out as
/// `<root>/blobs/<algorithm>/<hex>`, or in explicitly registered files.
pub struct FileSource {
    root: Option<PathBuf>,
    files: HashMap<Digest, PathBuf>,
    concurrency: usize,
}

impl FileSource {
    /// Serve blobs from the directory store at `root`.
    pub fn from_store(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            files: HashMap::new(),
            concurrency: super::DEFAULT_CHUNK_CONCURRENCY,
        }
    }

    /// Serve a single file as the blob `digest`.
    pub fn from_file(digest: Digest, path: impl Into<PathBuf>) -> Self {
        let mut files = HashMap::new();
        files.insert(digest, path.into());
        Self {
            root: None,
            files,
            concurrency: super::DEFAULT_CHUNK_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn path_for(&self, digest: &Digest) -> Option<PathBuf> {
        if let Some(p) = self.files.get(digest) {
            return Some(p.clone());
        }
        self.root.as_ref().map(|root| blob_path_in(root, digest))
    }
}

#[async_trait]
impl SeekableSource for FileSource {
    async fn get_blob_at(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        chunks: &[Chunk],
    ) -> Result<ChunkStreams> {
        check_request(chunks, info.size)?;

        let path = self
            .path_for(&info.digest)
            .ok_or_else(|| Error::NotFound(info.digest.to_string()))?;
        let len = match tokio::fs::metadata(&path).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(info.digest.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        check_request(chunks, Some(len))?;

        debug!(
            digest = %info.digest,
            path = %path.display(),
            chunks = chunks.len(),
            "serving chunks from file",
        );

        Ok(spawn_ordered(
            cancel.clone(),
            chunks.to_vec(),
            self.concurrency,
            move |c| {
                let path = path.clone();
                async move {
                    let mut file = tokio::fs::File::open(&path).await?;
                    file.seek(SeekFrom::Start(c.offset)).await?;
                    Ok::<BlobStream, Error>(Box::pin(file.take(c.length)))
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_ranges_from_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob");
        std::fs::write(&path, b"abcdefghij").unwrap();
        let info = BlobInfo::of_bytes(b"abcdefghij");

        let src = FileSource::from_file(info.digest.clone(), &path);
        let mut streams = src
            .get_blob_at(
                &CancellationToken::new(),
                &info,
                &[Chunk::new(0, 3), Chunk::new(8, 2)],
            )
            .await
            .unwrap();

        let mut out = Vec::new();
        while let Some(item) = streams.next().await {
            let mut s = item.unwrap();
            s.reader.read_to_end(&mut out).await.unwrap();
        }
        assert_eq!(out, b"abcij");
    }

    #[tokio::test]
    async fn past_end_is_a_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob");
        std::fs::write(&path, b"abc").unwrap();
        // Size metadata unknown: the file length is authoritative.
        let info = BlobInfo::new(Digest::sha256(b"abc"));

        let src = FileSource::from_file(info.digest.clone(), &path);
        let err = src
            .get_blob_at(&CancellationToken::new(), &info, &[Chunk::new(2, 5)])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::BadPartialRequest(_)));
    }

    #[tokio::test]
    async fn store_layout_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let data = b"stored blob";
        let info = BlobInfo::of_bytes(data);
        let path = blob_path_in(tmp.path(), &info.digest);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();

        let src = FileSource::from_store(tmp.path());
        let mut streams = src
            .get_blob_at(&CancellationToken::new(), &info, &[Chunk::new(7, 4)])
            .await
            .unwrap();
        let mut s = streams.next().await.unwrap().unwrap();
        let mut buf = String::new();
        s.reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "blob");
    }
}
