//! Error types for the model lifecycle and inference session.
//!
//! Every error here is recoverable: retry the download, reload the model or
//! resend the message.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown model: {0}")]
    NotFound(String),
}

/// Failure of a single transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("download request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download failed: HTTP {0}")]
    Status(u16),

    #[error("download I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download interrupted at {written} of {expected} bytes")]
    Interrupted { written: u64, expected: u64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("download cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the transfer may pick up again with a byte-range request.
    pub fn is_resumable(&self) -> bool {
        matches!(self, TransferError::Http(_) | TransferError::Interrupted { .. })
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a model load is already in progress")]
    LoadInProgress,

    #[error("failed to load model {}: {reason}", path.display())]
    LoadFailed { path: PathBuf, reason: String },

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("no model loaded or a response is still being generated")]
    NotReady,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unknown model: {0}")]
    NotFound(String),

    #[error("model {0} is already downloading")]
    AlreadyInProgress(String),

    #[error("model {0} is already downloaded")]
    AlreadyDownloaded(String),

    #[error("model {0} is not downloaded")]
    NotDownloaded(String),

    #[error("model file for {id} is missing at {}; download it again", path.display())]
    MissingFile { id: String, path: PathBuf },

    #[error("download of {id} failed: {source}")]
    DownloadFailed {
        id: String,
        #[source]
        source: TransferError,
    },

    #[error("failed to delete {id}: {source}")]
    DeletionFailed {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<CatalogError> for LifecycleError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => LifecycleError::NotFound(id),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}
