//! Error types for catalog_sync
//!
//! Errors are split by failure domain so the orchestrator can apply the right
//! policy: feed-level errors abort the run, per-record and per-image errors
//! are recorded and skipped.

use thiserror::Error;

/// Feed-level errors from a source adapter. Usually fatal to the run.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Reading the feed failed
    #[error("feed I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be parsed (per-record, skipped by adapters)
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    /// A required feed file is absent
    #[error("missing feed file: {0}")]
    MissingFile(String),
}

/// Per-record mapping errors. Caller treats these as a skip.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),
    #[error("invalid price: {0:?}")]
    InvalidPrice(String),
    #[error("invalid stock quantity: {0:?}")]
    InvalidStock(String),
}

/// Per-image errors. The product still syncs without the failed image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image unreachable: {0}")]
    Unreachable(String),
    #[error("image exceeds size limit ({0} bytes)")]
    TooLarge(usize),
    #[error("image download timed out: {0}")]
    Timeout(String),
    #[error("unsupported image format ({0})")]
    UnsupportedFormat(String),
    #[error("image decode failed: {0}")]
    Decode(String),
}

/// Errors from the remote catalog API.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Credentials rejected - recorded, never retried
    #[error("remote authentication failed")]
    AuthFailure,
    /// 429 from the remote - retried with backoff
    #[error("remote rate limit hit")]
    RateLimited,
    /// Remote rejected the payload - recorded, never retried
    #[error("remote validation failure: {0}")]
    ValidationFailure(String),
    /// Remote temporarily down - retried with exponential backoff
    #[error("remote unavailable (status {0})")]
    Unavailable(u16),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected remote status: {0}")]
    UnexpectedStatus(u16),
}

impl RemoteError {
    /// Whether the orchestrator should retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited | RemoteError::Unavailable(_) | RemoteError::Network(_)
        )
    }
}

/// Umbrella error for run-level operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for run-level operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RemoteError::RateLimited.is_retryable());
        assert!(RemoteError::Unavailable(503).is_retryable());
        assert!(!RemoteError::AuthFailure.is_retryable());
        assert!(!RemoteError::ValidationFailure("bad sku".into()).is_retryable());
    }

    #[test]
    fn source_error_from_io() {
        let err: SourceError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, SourceError::Io(_)));
    }
}
