use std::path::PathBuf;

use crate::embedding::EmbeddingError;
use crate::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("remote object s3://{bucket}/{key} unavailable: {reason}")]
    RemoteUnavailable {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("malformed metadata in {}: {reason}", .path.display())]
    MalformedMetadata { path: PathBuf, reason: String },

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("matcher service: {0}")]
    Matcher(#[from] reqwest::Error),

    #[error("embedding failed: {0}")]
    EmbeddingFailure(#[from] EmbeddingError),

    #[error("vector store failed: {0}")]
    StoreFailure(#[from] StoreError),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("io error: {0:?}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn remote(bucket: &str, key: &str, reason: impl ToString) -> Self {
        PipelineError::RemoteUnavailable {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}
