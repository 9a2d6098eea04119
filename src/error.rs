//! Error types for blobxfer

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using blobxfer Error
pub type Result<T> = std::result::Result<T, Error>;

/// Returned by a seekable source when the requested chunk set is invalid.
///
/// This is a caller-contract violation: it is reported before any I/O and
/// must not be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}")]
pub struct BadPartialRequestError {
    pub status: String,
}

impl BadPartialRequestError {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

/// Errors that can occur in blobxfer operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid chunk set passed to a seekable source
    #[error("bad partial request: {0}")]
    BadPartialRequest(#[from] BadPartialRequestError),

    /// Assembled or streamed content does not hash to the expected digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Two commits for the same layer index disagree on content
    #[error("layer {index}: conflicting commits ({existing} vs {requested})")]
    Consistency {
        index: usize,
        existing: String,
        requested: String,
    },

    /// The commit of a layer index failed; every waiter receives the cause
    #[error("layer {index} failed: {source}")]
    LayerFailed {
        index: usize,
        #[source]
        source: Arc<Error>,
    },

    /// Options-based and plain calls mixed on one destination session
    #[error("destination misuse: {0}")]
    Misuse(String),

    /// Contradictory per-call options
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The blob cannot be fetched partially; use a full transfer instead
    #[error("partial transfer unsupported: {0}")]
    PartialUnsupported(String),

    /// Malformed digest string
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// A chunk could not be produced by the source
    #[error("source error: {0}")]
    Source(String),

    /// A session was finished with layers still uncommitted
    #[error("incomplete image: {0}")]
    Incomplete(String),

    /// Operation cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Blob or object not present
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML configuration parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// An owned copy suitable for handing to several waiters.
    ///
    /// Variants wrapping foreign error types keep their message (and, for
    /// I/O, the error kind) but not the original source chain.
    pub(crate) fn to_shared(&self) -> Error {
        match self {
            Error::BadPartialRequest(e) => Error::BadPartialRequest(e.clone()),
            Error::DigestMismatch { expected, actual } => Error::DigestMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Error::Consistency {
                index,
                existing,
                requested,
            } => Error::Consistency {
                index: *index,
                existing: existing.clone(),
                requested: requested.clone(),
            },
            Error::LayerFailed { index, source } => Error::LayerFailed {
                index: *index,
                source: source.clone(),
            },
            Error::Misuse(m) => Error::Misuse(m.clone()),
            Error::InvalidOptions(m) => Error::InvalidOptions(m.clone()),
            Error::PartialUnsupported(m) => Error::PartialUnsupported(m.clone()),
            Error::InvalidDigest(m) => Error::InvalidDigest(m.clone()),
            Error::Source(m) => Error::Source(m.clone()),
            Error::Incomplete(m) => Error::Incomplete(m.clone()),
            Error::Cancelled => Error::Cancelled,
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::Config(m) => Error::Config(m.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Http(e) => Error::Source(e.to_string()),
            Error::Serde(e) => Error::Source(e.to_string()),
            Error::Yaml(e) => Error::Config(e.to_string()),
        }
    }

    /// Whether the failure came from the caller breaking an API contract
    /// (as opposed to a transfer, integrity or consistency failure).
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::BadPartialRequest(_) | Error::Misuse(_) | Error::InvalidOptions(_)
        )
    }
}
