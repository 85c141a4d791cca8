use std::time::Duration;

use thiserror::Error;

use crate::record::ErrorKind;

/// Failure reported by an inference backend.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference engine unavailable: {0}")]
    Unavailable(String),
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("image rejected by inference engine: {0}")]
    InvalidImage(String),
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::Unavailable(_) => ErrorKind::InferenceUnavailable,
            InferenceError::Timeout(_) => ErrorKind::InferenceTimeout,
            InferenceError::InvalidImage(_) => ErrorKind::InvalidImage,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Outcome classification returned by each pipeline stage.
///
/// Transient errors go to the retry scheduler; validation errors dead-letter
/// the fingerprint immediately.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("transient {}: {message}", kind.as_str())]
    Transient { kind: ErrorKind, message: String },
    #[error("validation {}: {message}", kind.as_str())]
    Validation { kind: ErrorKind, message: String },
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        if kind.is_transient() {
            StageError::Transient { kind, message }
        } else {
            StageError::Validation { kind, message }
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        StageError::new(ErrorKind::PersistenceIo, err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Transient { kind, .. } | StageError::Validation { kind, .. } => *kind,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient { .. })
    }
}

impl From<InferenceError> for StageError {
    fn from(err: InferenceError) -> Self {
        StageError::new(err.kind(), err.to_string())
    }
}

impl From<image::ImageError> for StageError {
    fn from(err: image::ImageError) -> Self {
        let kind = match &err {
            image::ImageError::Unsupported(_) => ErrorKind::UnsupportedFormat,
            image::ImageError::IoError(_) => ErrorKind::Unreadable,
            _ => ErrorKind::InvalidImage,
        };
        StageError::new(kind, err.to_string())
    }
}
