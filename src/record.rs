//! Ledger record types and the processing state machine.
//!
//! ```text
//! Pending --queued--> Stabilizing --dequeued--> Detecting --ok--> Succeeded
//!    ^                                              |
//!    +------------- transient, attempts left -------+
//!                                                   |--transient, exhausted--> DeadLettered
//!                                                   +--validation failure----> DeadLettered
//! ```
//!
//! `Failed` is a resting state: a record an operator resubmitted, or one whose
//! retry task went missing. Admission or startup recovery schedules it.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::fingerprint::Fingerprint;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingState {
    Pending,
    Stabilizing,
    Detecting,
    Succeeded,
    Failed,
    DeadLettered,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 6] = [
        ProcessingState::Pending,
        ProcessingState::Stabilizing,
        ProcessingState::Detecting,
        ProcessingState::Succeeded,
        ProcessingState::Failed,
        ProcessingState::DeadLettered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Stabilizing => "stabilizing",
            ProcessingState::Detecting => "detecting",
            ProcessingState::Succeeded => "succeeded",
            ProcessingState::Failed => "failed",
            ProcessingState::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == value)
            .ok_or_else(|| anyhow!("unknown processing state '{}'", value))
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingState::Succeeded | ProcessingState::DeadLettered
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ProcessingState::Pending | ProcessingState::Stabilizing | ProcessingState::Detecting
        )
    }
}

/// Why a fingerprint last failed to advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InferenceUnavailable,
    InferenceTimeout,
    PersistenceIo,
    /// Worker was mid-detection when the process stopped.
    Interrupted,
    InvalidImage,
    UnsupportedFormat,
    Unreadable,
    /// Bytes at the source path no longer hash to the record's fingerprint.
    ContentChanged,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::InferenceUnavailable,
        ErrorKind::InferenceTimeout,
        ErrorKind::PersistenceIo,
        ErrorKind::Interrupted,
        ErrorKind::InvalidImage,
        ErrorKind::UnsupportedFormat,
        ErrorKind::Unreadable,
        ErrorKind::ContentChanged,
    ];

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::InferenceUnavailable
                | ErrorKind::InferenceTimeout
                | ErrorKind::PersistenceIo
                | ErrorKind::Interrupted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InferenceUnavailable => "inference_unavailable",
            ErrorKind::InferenceTimeout => "inference_timeout",
            ErrorKind::PersistenceIo => "persistence_io",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::InvalidImage => "invalid_image",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::Unreadable => "unreadable",
            ErrorKind::ContentChanged => "content_changed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| anyhow!("unknown error kind '{}'", value))
    }
}

/// A file the watcher has seen hold still for the quiet period.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureEvent {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    pub modified_ms: u64,
    pub fingerprint: Fingerprint,
}

/// One durable row per fingerprint. Never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub fingerprint: Fingerprint,
    pub state: ProcessingState,
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
    /// Most recent path the content was observed at.
    pub source_path: PathBuf,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl ProcessingRecord {
    pub fn new(fingerprint: Fingerprint, source_path: PathBuf, now_ms: u64) -> Self {
        Self {
            fingerprint,
            state: ProcessingState::Pending,
            attempts: 0,
            last_error: None,
            source_path,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

/// Exists only while its record sits in Pending awaiting a retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTask {
    pub fingerprint: Fingerprint,
    pub next_attempt_ms: u64,
    pub backoff_level: u32,
}
