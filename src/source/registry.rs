use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::header::{AUTHORIZATION, RANGE};
use reqwest::StatusCode;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{check_request, spawn_ordered, ChunkStreams, SeekableSource};
use crate::blob::{BlobInfo, BlobStream};
use crate::chunk::Chunk;
use crate::error::BadPartialRequestError;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag or digest reference (e.g. "latest" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Config("empty image reference".to_string()));
        }

        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/', unlike a port.
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        // The first component is a registry host when it has a dot or a port.
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') => {
                (first.to_string(), rest.to_string())
            }
            _ => ("registry-1.docker.io".to_string(), name_part.to_string()),
        };

        let repository = if registry == "registry-1.docker.io" && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Cache scope for blobs of this repository: `registry/repository`.
    pub fn scope(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.reference.contains(':') { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

// ---------------------------------------------------------------------------
// RegistrySource
// ---------------------------------------------------------------------------

/// Seekable source backed by OCI distribution range requests.
///
/// Each chunk becomes one `GET /v2/<repo>/blobs/<digest>` with a `Range`
/// header; the registry must answer `206 Partial Content`.
pub struct RegistrySource {
    client: reqwest::Client,
    image: ImageRef,
    bearer_token: Option<String>,
    concurrency: usize,
}

impl RegistrySource {
    pub fn new(image: ImageRef) -> Result<Self> {
        Self::with_user_agent(image, concat!("blobxfer/", env!("CARGO_PKG_VERSION")))
    }

    pub fn with_user_agent(image: ImageRef, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            client,
            image,
            bearer_token: None,
            concurrency: super::DEFAULT_CHUNK_CONCURRENCY,
        })
    }

    /// Attach a pre-acquired bearer token to every request.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    fn blob_url(&self, info: &BlobInfo) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            registry_scheme(&self.image.registry),
            self.image.registry,
            self.image.repository,
            info.digest,
        )
    }
}

#[async_trait]
impl SeekableSource for RegistrySource {
    async fn get_blob_at(
        &self,
        cancel: &CancellationToken,
        info: &BlobInfo,
        chunks: &[Chunk],
    ) -> Result<ChunkStreams> {
        check_request(chunks, info.size)?;

        let url = self.blob_url(info);
        debug!(%url, chunks = chunks.len(), "requesting blob ranges");

        let client = self.client.clone();
        let token = self.bearer_token.clone();
        Ok(spawn_ordered(
            cancel.clone(),
            chunks.to_vec(),
            self.concurrency,
            move |c| fetch_range(client.clone(), url.clone(), token.clone(), c),
        ))
    }
}

async fn fetch_range(
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    chunk: Chunk,
) -> Result<BlobStream> {
    let range = chunk.http_range().ok_or_else(|| {
        BadPartialRequestError::new(format!("empty chunk at offset {}", chunk.offset))
    })?;
    let mut req = client.get(&url).header(RANGE, &range);
    if let Some(t) = token {
        req = req.header(AUTHORIZATION, format!("Bearer {}", t));
    }

    let resp = req.send().await?;
    match resp.status() {
        StatusCode::PARTIAL_CONTENT => {}
        StatusCode::NOT_FOUND => return Err(Error::NotFound(url)),
        StatusCode::OK => {
            return Err(Error::Source(format!(
                "GET {} ignored range {}",
                url, range
            )))
        }
        status => {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Source(format!(
                "GET {} returned {}: {}",
                url, status, body
            )));
        }
    }

    let body = resp.bytes_stream().map_err(std::io::Error::other);
    Ok(Box::pin(StreamReader::new(body).take(chunk.length)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
