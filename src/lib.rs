//! Capture pipeline
//!
//! Ingests images dropped into a capture folder by a phone-sync service,
//! runs object detection on each distinct image exactly once, and commits an
//! annotated copy plus a structured result.
//!
//! # Flow
//!
//! `CaptureWatcher` → `DedupLedger` (accept/reject) → bounded work queue →
//! `DetectionPipeline` worker → `ResultSink` on success, `RetryScheduler` on a
//! transient failure, dead-letter on a validation failure. `HealthReporter`
//! observes every stage.
//!
//! # Module Structure
//!
//! - `watcher`: stability-checked folder polling
//! - `ledger`: durable per-fingerprint state machine and retry tasks
//! - `detect`: backend contract, registry, post-processing
//! - `annotate` / `sink`: annotated image rendering and durable commit
//! - `retry`: backoff and the retry timer
//! - `pipeline`: composition and thread lifecycle

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod annotate;
pub mod clock;
pub mod config;
pub mod detect;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod ledger;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod sink;
pub mod watcher;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PipelineConfig;
pub use detect::{
    BackendRegistry, BoundingBox, CapturedImage, Detection, DetectionResult, DetectionSummary,
    DetectorBackend, StubBackend,
};
pub use error::{InferenceError, StageError};
pub use fingerprint::Fingerprint;
pub use health::{HealthReporter, HealthSink, HealthSnapshot, LogHealthSink, Outcome, Stage};
pub use ledger::{
    Admission, DedupLedger, FailureOutcome, InMemoryLedgerStore, LedgerStore, SqliteLedgerStore,
};
pub use pipeline::{
    DetectionPipeline, DispatchOutcome, Dispatcher, Intake, Pipeline, PipelineHandle,
    ShutdownReport, StepOutcome,
};
pub use record::{CaptureEvent, ErrorKind, ProcessingRecord, ProcessingState, RetryTask};
pub use retry::{Backoff, RetryScheduler};
pub use sink::{FilesystemResultStore, InMemoryResultStore, ResultSink, ResultStore};
pub use watcher::{CaptureSink, CaptureWatcher, WatcherConfig};

/// URI for a uniquely named shared in-memory SQLite database.
///
/// Several connections opened on the same URI see the same data, which lets
/// the ledger and the result store share one database in tests.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:capture_pipeline_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Connection::open(db_path)?)
}
