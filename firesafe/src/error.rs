use firesafe_storage::StorageError;
use thiserror::Error;

use crate::sources::SourceKind;

/// Failure reported by a source adapter.
///
/// The variant decides the orchestrator's policy: transient failures are
/// retried with backoff, fatal ones fail the source immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            SourceError::Transient(m) | SourceError::Fatal(m) => m,
        }
    }

    /// Classify an HTTP status returned by a platform API.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            408 | 429 | 500..=599 => {
                SourceError::Transient(format!("{} (status {})", context, status))
            }
            _ => SourceError::Fatal(format!("{} (status {})", context, status)),
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return SourceError::from_status(status.as_u16(), &e.to_string());
        }
        if e.is_decode() || e.is_builder() {
            SourceError::Fatal(e.to_string())
        } else {
            SourceError::Transient(e.to_string())
        }
    }
}

/// A value that cannot be represented in the portable format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot serialize value at '{path}': {reason}")]
pub struct SerializationError {
    pub path: String,
    pub reason: String,
}

impl SerializationError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] StorageError),

    #[error("checkpoint is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("checkpoint version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("checkpoint belongs to project '{found}', not '{expected}'")]
    ProjectMismatch { found: String, expected: String },

    #[error("checkpoint has no entry for source '{0}'")]
    UnknownSource(SourceKind),

    #[error("invalid progress update for '{kind}': {reason}")]
    InvalidTransition { kind: SourceKind, reason: String },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt artifact: {0}")]
    CorruptArtifact(String),
}

pub type Result<T> = std::result::Result<T, ExportError>;
