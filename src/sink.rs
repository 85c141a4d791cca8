//! Durable commit of detection results.
//!
//! A commit is: render the annotated copy, publish it under its fingerprint,
//! insert the structured row, then mark the ledger record `Succeeded`. Every
//! step is idempotent per fingerprint, so a retry after a partial commit
//! converges on a single artifact and a single row.

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::annotate::render_annotated;
use crate::clock::Clock;
use crate::detect::{CapturedImage, Detection, DetectionResult, DetectionSummary};
use crate::error::StageError;
use crate::fingerprint::Fingerprint;
use crate::ledger::DedupLedger;
use crate::open_db_connection;
use crate::record::{ErrorKind, ProcessingRecord};

/// Persistence collaborator for committed results.
pub trait ResultStore {
    /// Publish annotated JPEG bytes. Readers never see a partial file.
    fn store_annotated_image(&mut self, fingerprint: &Fingerprint, jpeg: &[u8]) -> Result<PathBuf>;

    /// Insert the structured result; returns its row id. Inserting a
    /// fingerprint that already has a row returns the existing id unchanged.
    fn store_detection_record(
        &mut self,
        record: &ProcessingRecord,
        result: &DetectionResult,
    ) -> Result<i64>;

    fn detection_result(&self, fingerprint: &Fingerprint) -> Result<Option<DetectionResult>>;

    fn result_count(&self) -> Result<usize>;
}

/// Annotated images on disk, structured rows in SQLite.
///
/// Layout under `output_dir`:
/// - `.staging/` temporary files, same filesystem as the final location
/// - `annotated/<fingerprint>.jpg` published images
pub struct FilesystemResultStore {
    staging_dir: PathBuf,
    annotated_dir: PathBuf,
    conn: Connection,
}

impl FilesystemResultStore {
    pub fn open(output_dir: &Path, db_path: &str) -> Result<Self> {
        let staging_dir = output_dir.join(".staging");
        let annotated_dir = output_dir.join("annotated");
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("failed to create {}", staging_dir.display()))?;
        fs::create_dir_all(&annotated_dir)
            .with_context(|| format!("failed to create {}", annotated_dir.display()))?;
        let conn = open_db_connection(db_path)?;
        let store = Self {
            staging_dir,
            annotated_dir,
            conn,
        };
        store.ensure_schema()?;
        store.sweep_staging();
        Ok(store)
    }

    pub fn annotated_dir(&self) -> &Path {
        &self.annotated_dir
    }

    /// Read one committed result without touching the output directory.
    pub fn lookup(db_path: &str, fingerprint: &Fingerprint) -> Result<Option<DetectionResult>> {
        let conn = open_db_connection(db_path)?;
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'detection_results'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }
        select_result(&conn, fingerprint)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detection_results (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              fingerprint TEXT NOT NULL UNIQUE,
              source_path TEXT NOT NULL,
              annotated_path TEXT NOT NULL,
              detections_json TEXT NOT NULL,
              summary_json TEXT NOT NULL,
              processing_ms INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Remove staging leftovers from an interrupted commit.
    fn sweep_staging(&self) {
        let entries = match fs::read_dir(&self.staging_dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("cannot list {}: {}", self.staging_dir.display(), err);
                return;
            }
        };
        for entry in entries.flatten() {
            if let Err(err) = fs::remove_file(entry.path()) {
                log::warn!("cannot remove stale {}: {}", entry.path().display(), err);
            }
        }
    }
}

fn write_atomic(staging: &Path, target: &Path, data: &[u8]) -> Result<()> {
    {
        let mut file = File::create(staging)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(staging, target) {
        let _ = fs::remove_file(staging);
        return Err(err.into());
    }
    Ok(())
}

fn result_from_row(row: &Row<'_>) -> Result<DetectionResult> {
    let fingerprint: String = row.get(0)?;
    let source_path: String = row.get(1)?;
    let annotated_path: String = row.get(2)?;
    let detections_json: String = row.get(3)?;
    let summary_json: String = row.get(4)?;
    let processing_ms: i64 = row.get(5)?;
    let created_at_ms: i64 = row.get(6)?;
    Ok(DetectionResult {
        fingerprint: Fingerprint::from_hex(&fingerprint)?,
        source_path: PathBuf::from(source_path),
        annotated_path: PathBuf::from(annotated_path),
        detections: serde_json::from_str(&detections_json)?,
        summary: serde_json::from_str(&summary_json)?,
        processing_ms: processing_ms as u64,
        created_at_ms: created_at_ms as u64,
    })
}

fn select_result(conn: &Connection, fingerprint: &Fingerprint) -> Result<Option<DetectionResult>> {
    let mut stmt = conn.prepare(
        "SELECT fingerprint, source_path, annotated_path, detections_json, summary_json, processing_ms, created_at_ms FROM detection_results WHERE fingerprint = ?1",
    )?;
    let mut rows = stmt.query(params![fingerprint.to_hex()])?;
    match rows.next()? {
        Some(row) => Ok(Some(result_from_row(row)?)),
        None => Ok(None),
    }
}

impl ResultStore for FilesystemResultStore {
    fn store_annotated_image(&mut self, fingerprint: &Fingerprint, jpeg: &[u8]) -> Result<PathBuf> {
        let target = self.annotated_dir.join(format!("{}.jpg", fingerprint.to_hex()));
        let mut nonce = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut nonce);
        let staging = self.staging_dir.join(format!(
            "{}.{}.tmp",
            fingerprint.to_hex(),
            hex::encode(nonce)
        ));
        write_atomic(&staging, &target, jpeg)
            .with_context(|| format!("failed to publish {}", target.display()))?;
        Ok(target)
    }

    fn store_detection_record(
        &mut self,
        record: &ProcessingRecord,
        result: &DetectionResult,
    ) -> Result<i64> {
        if record.fingerprint != result.fingerprint {
            return Err(anyhow!(
                "record {} does not match result {}",
                record.fingerprint.short(),
                result.fingerprint.short()
            ));
        }
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO detection_results(fingerprint, source_path, annotated_path, detections_json, summary_json, processing_ms, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                result.fingerprint.to_hex(),
                result.source_path.to_string_lossy(),
                result.annotated_path.to_string_lossy(),
                serde_json::to_string(&result.detections)?,
                serde_json::to_string(&result.summary)?,
                result.processing_ms as i64,
                result.created_at_ms as i64
            ],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM detection_results WHERE fingerprint = ?1",
            params![result.fingerprint.to_hex()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(id)
    }

    fn detection_result(&self, fingerprint: &Fingerprint) -> Result<Option<DetectionResult>> {
        select_result(&self.conn, fingerprint)
    }

    fn result_count(&self) -> Result<usize> {
        let count: Option<i64> = self
            .conn
            .query_row("SELECT COUNT(*) FROM detection_results", [], |row| row.get(0))
            .optional()?;
        Ok(count.unwrap_or(0) as usize)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryResultStore {
    images: HashMap<Fingerprint, Vec<u8>>,
    results: Vec<DetectionResult>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self, fingerprint: &Fingerprint) -> Option<&[u8]> {
        self.images.get(fingerprint).map(Vec::as_slice)
    }
}

impl ResultStore for InMemoryResultStore {
    fn store_annotated_image(&mut self, fingerprint: &Fingerprint, jpeg: &[u8]) -> Result<PathBuf> {
        self.images.insert(*fingerprint, jpeg.to_vec());
        Ok(PathBuf::from(format!("memory://{}.jpg", fingerprint.to_hex())))
    }

    fn store_detection_record(
        &mut self,
        _record: &ProcessingRecord,
        result: &DetectionResult,
    ) -> Result<i64> {
        if let Some(pos) = self
            .results
            .iter()
            .position(|existing| existing.fingerprint == result.fingerprint)
        {
            return Ok(pos as i64 + 1);
        }
        self.results.push(result.clone());
        Ok(self.results.len() as i64)
    }

    fn detection_result(&self, fingerprint: &Fingerprint) -> Result<Option<DetectionResult>> {
        Ok(self
            .results
            .iter()
            .find(|result| result.fingerprint == *fingerprint)
            .cloned())
    }

    fn result_count(&self) -> Result<usize> {
        Ok(self.results.len())
    }
}

/// Commits results and closes out the ledger record.
pub struct ResultSink {
    store: Mutex<Box<dyn ResultStore + Send>>,
    ledger: Arc<DedupLedger>,
    clock: Arc<dyn Clock>,
    jpeg_quality: u8,
}

impl ResultSink {
    pub fn new(
        store: Box<dyn ResultStore + Send>,
        ledger: Arc<DedupLedger>,
        clock: Arc<dyn Clock>,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            ledger,
            clock,
            jpeg_quality,
        }
    }

    /// Commit one result. Persistence failures come back transient; an
    /// image that cannot be re-encoded is a validation failure.
    ///
    /// `processing_ms` is measured from `started` until the annotated image
    /// is published.
    pub fn commit(
        &self,
        record: &ProcessingRecord,
        image: &CapturedImage,
        detections: Vec<Detection>,
        started: Instant,
    ) -> Result<DetectionResult, StageError> {
        let jpeg = render_annotated(image.rgb(), &detections, self.jpeg_quality)
            .map_err(|err| StageError::new(ErrorKind::InvalidImage, err.to_string()))?;

        let result = {
            let mut store = self.lock_store()?;
            let annotated_path = store
                .store_annotated_image(&record.fingerprint, &jpeg)
                .map_err(StageError::persistence)?;
            let processing_ms = started.elapsed().as_millis() as u64;
            let summary = DetectionSummary::from_detections(&detections);
            let result = DetectionResult {
                fingerprint: record.fingerprint,
                source_path: record.source_path.clone(),
                annotated_path,
                detections,
                summary,
                processing_ms,
                created_at_ms: self.clock.now_ms(),
            };
            let id = store
                .store_detection_record(record, &result)
                .map_err(StageError::persistence)?;
            log::debug!("stored result {} for {}", id, record.fingerprint.short());
            result
        };

        self.finish(&record.fingerprint)?;
        Ok(result)
    }

    /// Close out the ledger record of an already stored result.
    pub fn finish(&self, fingerprint: &Fingerprint) -> Result<(), StageError> {
        self.ledger
            .mark_succeeded(fingerprint)
            .map_err(StageError::persistence)
    }

    pub fn detection_result(&self, fingerprint: &Fingerprint) -> Result<Option<DetectionResult>> {
        self.lock_store()
            .map_err(|err| anyhow!("{err}"))?
            .detection_result(fingerprint)
    }

    pub fn result_count(&self) -> Result<usize> {
        self.lock_store()
            .map_err(|err| anyhow!("{err}"))?
            .result_count()
    }

    fn lock_store(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Box<dyn ResultStore + Send>>, StageError> {
        self.store
            .lock()
            .map_err(|_| StageError::persistence("result store lock poisoned"))
    }
}
