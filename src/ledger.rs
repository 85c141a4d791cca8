//! Durable fingerprint ledger.
//!
//! `DedupLedger` is the single source of truth for "has this content been
//! seen". Every operation runs under one mutex and writes through a
//! `LedgerStore` in a single store transaction, so a check followed by an
//! insert or a state transition is indivisible relative to the watcher, the
//! workers and the retry timer.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::fingerprint::Fingerprint;
use crate::record::{CaptureEvent, ErrorKind, ProcessingRecord, ProcessingState, RetryTask};
use crate::open_db_connection;

/// What to do with a record's retry task when the record is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryChange {
    Keep,
    Set(RetryTask),
    Clear,
}

pub trait LedgerStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ProcessingRecord>>;

    /// Upsert the record and apply the retry change atomically.
    fn put(&mut self, record: &ProcessingRecord, retry: RetryChange) -> Result<()>;

    fn retry_task(&self, fingerprint: &Fingerprint) -> Result<Option<RetryTask>>;

    fn retry_tasks(&self) -> Result<Vec<RetryTask>>;

    /// Records ordered by creation time, optionally filtered by state.
    fn records(&self, state: Option<ProcessingState>) -> Result<Vec<ProcessingRecord>>;
}

pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS processing_records (
              fingerprint TEXT PRIMARY KEY,
              state TEXT NOT NULL,
              attempts INTEGER NOT NULL,
              last_error TEXT,
              source_path TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS retry_tasks (
              fingerprint TEXT PRIMARY KEY,
              next_attempt_ms INTEGER NOT NULL,
              backoff_level INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_state ON processing_records(state);
            "#,
        )?;
        Ok(())
    }
}

fn record_from_row(row: &Row<'_>) -> Result<ProcessingRecord> {
    let fingerprint: String = row.get(0)?;
    let state: String = row.get(1)?;
    let attempts: i64 = row.get(2)?;
    let last_error: Option<String> = row.get(3)?;
    let source_path: String = row.get(4)?;
    let created_at_ms: i64 = row.get(5)?;
    let updated_at_ms: i64 = row.get(6)?;
    Ok(ProcessingRecord {
        fingerprint: Fingerprint::from_hex(&fingerprint)?,
        state: ProcessingState::parse(&state)?,
        attempts: u32::try_from(attempts).map_err(|_| anyhow!("corrupt record: attempts"))?,
        last_error: last_error.as_deref().map(ErrorKind::parse).transpose()?,
        source_path: PathBuf::from(source_path),
        created_at_ms: created_at_ms as u64,
        updated_at_ms: updated_at_ms as u64,
    })
}

fn task_from_row(row: &Row<'_>) -> Result<RetryTask> {
    let fingerprint: String = row.get(0)?;
    let next_attempt_ms: i64 = row.get(1)?;
    let backoff_level: i64 = row.get(2)?;
    Ok(RetryTask {
        fingerprint: Fingerprint::from_hex(&fingerprint)?,
        next_attempt_ms: next_attempt_ms as u64,
        backoff_level: backoff_level as u32,
    })
}

const RECORD_COLUMNS: &str =
    "fingerprint, state, attempts, last_error, source_path, created_at_ms, updated_at_ms";

impl LedgerStore for SqliteLedgerStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ProcessingRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM processing_records WHERE fingerprint = ?1",
            RECORD_COLUMNS
        ))?;
        let mut rows = stmt.query(params![fingerprint.to_hex()])?;
        match rows.next()? {
            Some(row) => Ok(Some(record_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, record: &ProcessingRecord, retry: RetryChange) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO processing_records(fingerprint, state, attempts, last_error, source_path, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(fingerprint) DO UPDATE SET
              state = excluded.state,
              attempts = excluded.attempts,
              last_error = excluded.last_error,
              source_path = excluded.source_path,
              updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                record.fingerprint.to_hex(),
                record.state.as_str(),
                record.attempts as i64,
                record.last_error.map(|kind| kind.as_str()),
                record.source_path.to_string_lossy(),
                record.created_at_ms as i64,
                record.updated_at_ms as i64
            ],
        )?;
        match retry {
            RetryChange::Keep => {}
            RetryChange::Set(task) => {
                tx.execute(
                    r#"
                    INSERT INTO retry_tasks(fingerprint, next_attempt_ms, backoff_level)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(fingerprint) DO UPDATE SET
                      next_attempt_ms = excluded.next_attempt_ms,
                      backoff_level = excluded.backoff_level
                    "#,
                    params![
                        task.fingerprint.to_hex(),
                        task.next_attempt_ms as i64,
                        task.backoff_level as i64
                    ],
                )?;
            }
            RetryChange::Clear => {
                tx.execute(
                    "DELETE FROM retry_tasks WHERE fingerprint = ?1",
                    params![record.fingerprint.to_hex()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn retry_task(&self, fingerprint: &Fingerprint) -> Result<Option<RetryTask>> {
        let row = self
            .conn
            .query_row(
                "SELECT fingerprint, next_attempt_ms, backoff_level FROM retry_tasks WHERE fingerprint = ?1",
                params![fingerprint.to_hex()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(fp, next, level)| {
            Ok(RetryTask {
                fingerprint: Fingerprint::from_hex(&fp)?,
                next_attempt_ms: next as u64,
                backoff_level: level as u32,
            })
        })
        .transpose()
    }

    fn retry_tasks(&self) -> Result<Vec<RetryTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT fingerprint, next_attempt_ms, backoff_level FROM retry_tasks ORDER BY next_attempt_ms ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(task_from_row(row)?);
        }
        Ok(out)
    }

    fn records(&self, state: Option<ProcessingState>) -> Result<Vec<ProcessingRecord>> {
        let mut out = Vec::new();
        match state {
            Some(state) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM processing_records WHERE state = ?1 ORDER BY created_at_ms ASC, fingerprint ASC",
                    RECORD_COLUMNS
                ))?;
                let mut rows = stmt.query(params![state.as_str()])?;
                while let Some(row) = rows.next()? {
                    out.push(record_from_row(row)?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM processing_records ORDER BY created_at_ms ASC, fingerprint ASC",
                    RECORD_COLUMNS
                ))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    out.push(record_from_row(row)?);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryLedgerStore {
    records: HashMap<Fingerprint, ProcessingRecord>,
    tasks: HashMap<Fingerprint, RetryTask>,
}

impl LedgerStore for InMemoryLedgerStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ProcessingRecord>> {
        Ok(self.records.get(fingerprint).cloned())
    }

    fn put(&mut self, record: &ProcessingRecord, retry: RetryChange) -> Result<()> {
        let created_at_ms = self
            .records
            .get(&record.fingerprint)
            .map(|existing| existing.created_at_ms)
            .unwrap_or(record.created_at_ms);
        let mut stored = record.clone();
        stored.created_at_ms = created_at_ms;
        self.records.insert(record.fingerprint, stored);
        match retry {
            RetryChange::Keep => {}
            RetryChange::Set(task) => {
                self.tasks.insert(task.fingerprint, task);
            }
            RetryChange::Clear => {
                self.tasks.remove(&record.fingerprint);
            }
        }
        Ok(())
    }

    fn retry_task(&self, fingerprint: &Fingerprint) -> Result<Option<RetryTask>> {
        Ok(self.tasks.get(fingerprint).copied())
    }

    fn retry_tasks(&self) -> Result<Vec<RetryTask>> {
        let mut out: Vec<RetryTask> = self.tasks.values().copied().collect();
        out.sort_by_key(|task| (task.next_attempt_ms, task.fingerprint));
        Ok(out)
    }

    fn records(&self, state: Option<ProcessingState>) -> Result<Vec<ProcessingRecord>> {
        let mut out: Vec<ProcessingRecord> = self
            .records
            .values()
            .filter(|record| state.map_or(true, |s| record.state == s))
            .cloned()
            .collect();
        out.sort_by_key(|record| (record.created_at_ms, record.fingerprint));
        Ok(out)
    }
}

/// Result of offering a capture event to the ledger.
#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
    /// New fingerprint; a Pending record now exists.
    Accepted(ProcessingRecord),
    /// Already Succeeded or DeadLettered.
    Duplicate(ProcessingState),
    /// Pending, Stabilizing or Detecting elsewhere.
    InFlight(ProcessingState),
    /// Previously Failed with attempts left; handed to the retry scheduler.
    RetryScheduled(RetryTask),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry(RetryTask),
    DeadLettered,
}

pub struct DedupLedger {
    store: Mutex<Box<dyn LedgerStore + Send>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl DedupLedger {
    pub fn new(store: Box<dyn LedgerStore + Send>, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            store: Mutex::new(store),
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn open_sqlite(db_path: &str, clock: Arc<dyn Clock>, max_attempts: u32) -> Result<Self> {
        let store = SqliteLedgerStore::open(db_path)?;
        Ok(Self::new(Box::new(store), clock, max_attempts))
    }

    pub fn in_memory(clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self::new(Box::new(InMemoryLedgerStore::default()), clock, max_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&mut (dyn LedgerStore + Send), u64) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| anyhow!("ledger lock poisoned"))?;
        let now = self.clock.now_ms();
        f(guard.as_mut(), now)
    }

    /// Atomic check-and-insert for a stable capture.
    pub fn admit(&self, event: &CaptureEvent) -> Result<Admission> {
        let max_attempts = self.max_attempts;
        self.with_store(|store, now| {
            let Some(mut record) = store.get(&event.fingerprint)? else {
                let record = ProcessingRecord::new(event.fingerprint, event.path.clone(), now);
                store.put(&record, RetryChange::Keep)?;
                return Ok(Admission::Accepted(record));
            };
            match record.state {
                ProcessingState::Succeeded | ProcessingState::DeadLettered => {
                    Ok(Admission::Duplicate(record.state))
                }
                ProcessingState::Pending
                | ProcessingState::Stabilizing
                | ProcessingState::Detecting => Ok(Admission::InFlight(record.state)),
                ProcessingState::Failed if record.attempts < max_attempts => {
                    record.state = ProcessingState::Pending;
                    record.source_path = event.path.clone();
                    record.updated_at_ms = now;
                    let task = RetryTask {
                        fingerprint: record.fingerprint,
                        next_attempt_ms: now,
                        backoff_level: record.attempts,
                    };
                    store.put(&record, RetryChange::Set(task))?;
                    Ok(Admission::RetryScheduled(task))
                }
                ProcessingState::Failed => {
                    record.state = ProcessingState::DeadLettered;
                    record.updated_at_ms = now;
                    store.put(&record, RetryChange::Clear)?;
                    Ok(Admission::Duplicate(ProcessingState::DeadLettered))
                }
            }
        })
    }

    /// Pending -> Stabilizing as the fingerprint enters the work queue.
    /// Returns false if the record is not Pending.
    pub fn mark_queued(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.with_store(|store, now| {
            let Some(mut record) = store.get(fingerprint)? else {
                return Ok(false);
            };
            if record.state != ProcessingState::Pending {
                return Ok(false);
            }
            record.state = ProcessingState::Stabilizing;
            record.updated_at_ms = now;
            store.put(&record, RetryChange::Clear)?;
            Ok(true)
        })
    }

    /// Stabilizing -> Detecting as a worker dequeues the fingerprint.
    /// Returns None when another path already claimed it.
    pub fn begin_detecting(&self, fingerprint: &Fingerprint) -> Result<Option<ProcessingRecord>> {
        self.with_store(|store, now| {
            let Some(mut record) = store.get(fingerprint)? else {
                return Ok(None);
            };
            if record.state != ProcessingState::Stabilizing {
                return Ok(None);
            }
            record.state = ProcessingState::Detecting;
            record.updated_at_ms = now;
            store.put(&record, RetryChange::Keep)?;
            Ok(Some(record))
        })
    }

    pub fn mark_succeeded(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.with_store(|store, now| {
            let mut record = require(store, fingerprint)?;
            expect_state(&record, ProcessingState::Detecting)?;
            record.state = ProcessingState::Succeeded;
            record.updated_at_ms = now;
            store.put(&record, RetryChange::Clear)
        })
    }

    /// Detecting -> Pending (with a stored retry task) or DeadLettered once
    /// `max_attempts` failures have accumulated. `delay_ms` maps the new
    /// attempt count to the backoff delay.
    pub fn record_transient_failure(
        &self,
        fingerprint: &Fingerprint,
        kind: ErrorKind,
        delay_ms: impl FnOnce(u32) -> u64,
    ) -> Result<FailureOutcome> {
        let max_attempts = self.max_attempts;
        self.with_store(|store, now| {
            let mut record = require(store, fingerprint)?;
            expect_state(&record, ProcessingState::Detecting)?;
            fail_in_place(store, &mut record, kind, now, max_attempts, delay_ms)
        })
    }

    /// Detecting -> DeadLettered for non-transient failures.
    pub fn dead_letter(&self, fingerprint: &Fingerprint, kind: ErrorKind) -> Result<()> {
        self.with_store(|store, now| {
            let mut record = require(store, fingerprint)?;
            expect_state(&record, ProcessingState::Detecting)?;
            record.state = ProcessingState::DeadLettered;
            record.last_error = Some(kind);
            record.updated_at_ms = now;
            store.put(&record, RetryChange::Clear)
        })
    }

    /// Park a Pending or Stabilizing record with a retry task without
    /// consuming an attempt. Used when the work queue is at capacity.
    pub fn defer(&self, fingerprint: &Fingerprint, next_attempt_ms: u64) -> Result<Option<RetryTask>> {
        self.with_store(|store, now| {
            let mut record = require(store, fingerprint)?;
            if !matches!(
                record.state,
                ProcessingState::Pending | ProcessingState::Stabilizing
            ) {
                return Ok(None);
            }
            record.state = ProcessingState::Pending;
            record.updated_at_ms = now;
            let task = RetryTask {
                fingerprint: record.fingerprint,
                next_attempt_ms,
                backoff_level: record.attempts,
            };
            store.put(&record, RetryChange::Set(task))?;
            Ok(Some(task))
        })
    }

    /// Detecting -> Pending with a retry task `delay_ms` from now, attempts
    /// unchanged. Used when a worker could not record its attempt's outcome.
    /// Returns None if the record is no longer Detecting.
    pub fn release(
        &self,
        fingerprint: &Fingerprint,
        kind: ErrorKind,
        delay_ms: u64,
    ) -> Result<Option<RetryTask>> {
        self.with_store(|store, now| {
            let mut record = require(store, fingerprint)?;
            if record.state != ProcessingState::Detecting {
                return Ok(None);
            }
            let task = requeue_in_place(store, &mut record, kind, now, now.saturating_add(delay_ms))?;
            Ok(Some(task))
        })
    }

    /// Rebuild schedulable work after a restart.
    ///
    /// Returns every retry task that should be loaded into the scheduler,
    /// stored next-attempt times preserved. A record caught mid-detection is
    /// requeued as `Interrupted` without consuming an attempt, so a crash can
    /// never dead-letter it.
    pub fn recover(&self, delay_ms: impl Fn(u32) -> u64) -> Result<Vec<RetryTask>> {
        let max_attempts = self.max_attempts;
        self.with_store(|store, now| {
            let mut tasks = Vec::new();
            for mut record in store.records(None)? {
                match record.state {
                    ProcessingState::Succeeded | ProcessingState::DeadLettered => {}
                    ProcessingState::Detecting => {
                        log::warn!(
                            "recovery: {} was mid-detection at shutdown, requeued",
                            record.fingerprint
                        );
                        let next_attempt_ms =
                            now.saturating_add(delay_ms(record.attempts.saturating_add(1)));
                        tasks.push(requeue_in_place(
                            store,
                            &mut record,
                            ErrorKind::Interrupted,
                            now,
                            next_attempt_ms,
                        )?);
                    }
                    ProcessingState::Pending => match store.retry_task(&record.fingerprint)? {
                        Some(task) => tasks.push(task),
                        None => tasks.push(park_now(store, &mut record, now)?),
                    },
                    ProcessingState::Stabilizing => {
                        tasks.push(park_now(store, &mut record, now)?);
                    }
                    ProcessingState::Failed if record.attempts < max_attempts => {
                        tasks.push(park_now(store, &mut record, now)?);
                    }
                    ProcessingState::Failed => {
                        record.state = ProcessingState::DeadLettered;
                        record.updated_at_ms = now;
                        store.put(&record, RetryChange::Clear)?;
                    }
                }
            }
            tasks.sort_by_key(|task| (task.next_attempt_ms, task.fingerprint));
            Ok(tasks)
        })
    }

    /// Operator resubmission: DeadLettered -> Failed with attempts reset.
    pub fn resubmit(&self, fingerprint: &Fingerprint) -> Result<ProcessingRecord> {
        self.with_store(|store, now| {
            let mut record = require(store, fingerprint)?;
            expect_state(&record, ProcessingState::DeadLettered)?;
            record.state = ProcessingState::Failed;
            record.attempts = 0;
            record.updated_at_ms = now;
            store.put(&record, RetryChange::Clear)?;
            Ok(record)
        })
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ProcessingRecord>> {
        self.with_store(|store, _| store.get(fingerprint))
    }

    pub fn retry_task(&self, fingerprint: &Fingerprint) -> Result<Option<RetryTask>> {
        self.with_store(|store, _| store.retry_task(fingerprint))
    }

    pub fn retry_tasks(&self) -> Result<Vec<RetryTask>> {
        self.with_store(|store, _| store.retry_tasks())
    }

    pub fn records(&self, state: Option<ProcessingState>) -> Result<Vec<ProcessingRecord>> {
        self.with_store(|store, _| store.records(state))
    }
}

fn require(store: &(dyn LedgerStore + Send), fingerprint: &Fingerprint) -> Result<ProcessingRecord> {
    store
        .get(fingerprint)?
        .ok_or_else(|| anyhow!("no processing record for {}", fingerprint))
}

fn expect_state(record: &ProcessingRecord, expected: ProcessingState) -> Result<()> {
    if record.state != expected {
        return Err(anyhow!(
            "record {} is {:?}, expected {:?}",
            record.fingerprint,
            record.state,
            expected
        ));
    }
    Ok(())
}

fn fail_in_place(
    store: &mut (dyn LedgerStore + Send),
    record: &mut ProcessingRecord,
    kind: ErrorKind,
    now: u64,
    max_attempts: u32,
    delay_ms: impl FnOnce(u32) -> u64,
) -> Result<FailureOutcome> {
    record.attempts = record.attempts.saturating_add(1);
    record.last_error = Some(kind);
    record.updated_at_ms = now;
    if record.attempts >= max_attempts {
        record.state = ProcessingState::DeadLettered;
        store.put(record, RetryChange::Clear)?;
        return Ok(FailureOutcome::DeadLettered);
    }
    record.state = ProcessingState::Pending;
    let task = RetryTask {
        fingerprint: record.fingerprint,
        next_attempt_ms: now.saturating_add(delay_ms(record.attempts)),
        backoff_level: record.attempts,
    };
    store.put(record, RetryChange::Set(task))?;
    Ok(FailureOutcome::Retry(task))
}

fn requeue_in_place(
    store: &mut (dyn LedgerStore + Send),
    record: &mut ProcessingRecord,
    kind: ErrorKind,
    now: u64,
    next_attempt_ms: u64,
) -> Result<RetryTask> {
    record.state = ProcessingState::Pending;
    record.last_error = Some(kind);
    record.updated_at_ms = now;
    let task = RetryTask {
        fingerprint: record.fingerprint,
        next_attempt_ms,
        backoff_level: record.attempts,
    };
    store.put(record, RetryChange::Set(task))?;
    Ok(task)
}

fn park_now(
    store: &mut (dyn LedgerStore + Send),
    record: &mut ProcessingRecord,
    now: u64,
) -> Result<RetryTask> {
    record.state = ProcessingState::Pending;
    record.updated_at_ms = now;
    let task = RetryTask {
        fingerprint: record.fingerprint,
        next_attempt_ms: now,
        backoff_level: record.attempts,
    };
    store.put(record, RetryChange::Set(task))?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn event(bytes: &[u8], name: &str) -> CaptureEvent {
        CaptureEvent {
            path: PathBuf::from(name),
            size: bytes.len() as u64,
            modified_ms: 0,
            fingerprint: Fingerprint::of_bytes(bytes),
        }
    }

    fn ledger(clock: &ManualClock) -> DedupLedger {
        DedupLedger::in_memory(Arc::new(clock.clone()), 3)
    }

    fn drive_to_detecting(ledger: &DedupLedger, fp: &Fingerprint) {
        assert!(ledger.mark_queued(fp).unwrap());
        assert!(ledger.begin_detecting(fp).unwrap().is_some());
    }

    #[test]
    fn same_content_under_two_names_is_one_record() -> Result<()> {
        let clock = ManualClock::new(10);
        let ledger = ledger(&clock);
        let first = ledger.admit(&event(b"cat", "IMG_1.jpg"))?;
        assert!(matches!(first, Admission::Accepted(_)));
        let second = ledger.admit(&event(b"cat", "IMG_1 (1).jpg"))?;
        assert_eq!(second, Admission::InFlight(ProcessingState::Pending));
        assert_eq!(ledger.records(None)?.len(), 1);
        Ok(())
    }

    #[test]
    fn terminal_records_reject_without_side_effects() -> Result<()> {
        let clock = ManualClock::new(10);
        let ledger = ledger(&clock);
        let ev = event(b"cat", "a.jpg");
        ledger.admit(&ev)?;
        drive_to_detecting(&ledger, &ev.fingerprint);
        ledger.mark_succeeded(&ev.fingerprint)?;
        let before = ledger.get(&ev.fingerprint)?;

        clock.advance_ms(1_000);
        let again = ledger.admit(&event(b"cat", "renamed.jpg"))?;
        assert_eq!(again, Admission::Duplicate(ProcessingState::Succeeded));
        assert_eq!(ledger.get(&ev.fingerprint)?, before);
        Ok(())
    }

    #[test]
    fn transient_failures_dead_letter_after_max_attempts() -> Result<()> {
        let clock = ManualClock::new(0);
        let ledger = ledger(&clock);
        let ev = event(b"flaky", "f.jpg");
        ledger.admit(&ev)?;
        let fp = ev.fingerprint;

        for attempt in 1..3u32 {
            drive_to_detecting(&ledger, &fp);
            let outcome =
                ledger.record_transient_failure(&fp, ErrorKind::InferenceTimeout, |n| n as u64 * 100)?;
            let FailureOutcome::Retry(task) = outcome else {
                panic!("expected retry on attempt {}", attempt);
            };
            assert_eq!(task.backoff_level, attempt);
            assert_eq!(task.next_attempt_ms, attempt as u64 * 100);
            assert_eq!(ledger.retry_task(&fp)?, Some(task));
            assert_eq!(ledger.get(&fp)?.unwrap().state, ProcessingState::Pending);
        }

        drive_to_detecting(&ledger, &fp);
        let outcome = ledger.record_transient_failure(&fp, ErrorKind::InferenceTimeout, |_| 100)?;
        assert_eq!(outcome, FailureOutcome::DeadLettered);
        let record = ledger.get(&fp)?.unwrap();
        assert_eq!(record.state, ProcessingState::DeadLettered);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_error, Some(ErrorKind::InferenceTimeout));
        assert_eq!(ledger.retry_task(&fp)?, None);
        Ok(())
    }

    #[test]
    fn claims_are_exclusive() -> Result<()> {
        let clock = ManualClock::new(0);
        let ledger = ledger(&clock);
        let ev = event(b"once", "o.jpg");
        ledger.admit(&ev)?;
        assert!(ledger.mark_queued(&ev.fingerprint)?);
        assert!(!ledger.mark_queued(&ev.fingerprint)?);
        assert!(ledger.begin_detecting(&ev.fingerprint)?.is_some());
        assert!(ledger.begin_detecting(&ev.fingerprint)?.is_none());
        Ok(())
    }

    #[test]
    fn resubmitted_record_is_rescheduled_on_capture() -> Result<()> {
        let clock = ManualClock::new(0);
        let ledger = ledger(&clock);
        let ev = event(b"broken", "b.jpg");
        ledger.admit(&ev)?;
        drive_to_detecting(&ledger, &ev.fingerprint);
        ledger.dead_letter(&ev.fingerprint, ErrorKind::InvalidImage)?;
        assert!(ledger.resubmit(&ev.fingerprint)?.state == ProcessingState::Failed);

        clock.set_ms(500);
        let admission = ledger.admit(&event(b"broken", "fixed-name.jpg"))?;
        let Admission::RetryScheduled(task) = admission else {
            panic!("expected retry scheduling, got {:?}", admission);
        };
        assert_eq!(task.next_attempt_ms, 500);
        let record = ledger.get(&ev.fingerprint)?.unwrap();
        assert_eq!(record.state, ProcessingState::Pending);
        assert_eq!(record.source_path, PathBuf::from("fixed-name.jpg"));
        Ok(())
    }

    #[test]
    fn sqlite_store_survives_reopen_with_retry_task() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("ledger.db");
        let db = db.to_string_lossy().to_string();
        let clock = ManualClock::new(1_000);
        let fp;
        {
            let ledger = DedupLedger::open_sqlite(&db, Arc::new(clock.clone()), 5)?;
            let ev = event(b"persist", "p.jpg");
            fp = ev.fingerprint;
            ledger.admit(&ev)?;
            drive_to_detecting(&ledger, &fp);
            ledger.record_transient_failure(&fp, ErrorKind::PersistenceIo, |_| 4_000)?;
        }
        clock.advance_ms(1_000);
        let ledger = DedupLedger::open_sqlite(&db, Arc::new(clock.clone()), 5)?;
        let tasks = ledger.recover(|_| 0)?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].next_attempt_ms, 5_000);
        let record = ledger.get(&fp)?.unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error, Some(ErrorKind::PersistenceIo));
        assert_eq!(record.created_at_ms, 1_000);
        Ok(())
    }

    #[test]
    fn recovery_requeues_in_flight_records() -> Result<()> {
        let clock = ManualClock::new(0);
        let ledger = ledger(&clock);
        let queued = event(b"queued", "q.jpg");
        let detecting = event(b"detecting", "d.jpg");
        let pending = event(b"pending", "p.jpg");
        for ev in [&queued, &detecting, &pending] {
            ledger.admit(ev)?;
        }
        ledger.mark_queued(&queued.fingerprint)?;
        drive_to_detecting(&ledger, &detecting.fingerprint);

        clock.set_ms(100);
        let tasks = ledger.recover(|_| 50)?;
        assert_eq!(tasks.len(), 3);

        let interrupted = ledger.get(&detecting.fingerprint)?.unwrap();
        assert_eq!(interrupted.state, ProcessingState::Pending);
        assert_eq!(interrupted.attempts, 0);
        assert_eq!(interrupted.last_error, Some(ErrorKind::Interrupted));
        assert_eq!(
            ledger.retry_task(&detecting.fingerprint)?.unwrap().next_attempt_ms,
            150
        );

        let requeued = ledger.get(&queued.fingerprint)?.unwrap();
        assert_eq!(requeued.state, ProcessingState::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(ledger.retry_task(&pending.fingerprint)?.unwrap().next_attempt_ms, 100);
        Ok(())
    }

    #[test]
    fn crash_on_last_attempt_stays_retryable() -> Result<()> {
        let clock = ManualClock::new(0);
        let ledger = ledger(&clock);
        let ev = event(b"last try", "l.jpg");
        ledger.admit(&ev)?;
        let fp = ev.fingerprint;
        for _ in 0..2 {
            drive_to_detecting(&ledger, &fp);
            ledger.record_transient_failure(&fp, ErrorKind::InferenceUnavailable, |_| 0)?;
        }
        drive_to_detecting(&ledger, &fp);
        assert_eq!(ledger.get(&fp)?.unwrap().attempts, ledger.max_attempts() - 1);

        clock.set_ms(1_000);
        let tasks = ledger.recover(|n| n as u64 * 10)?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].next_attempt_ms, 1_030);
        let record = ledger.get(&fp)?.unwrap();
        assert_eq!(record.state, ProcessingState::Pending);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_error, Some(ErrorKind::Interrupted));

        // The attempt after the restart still counts normally.
        ledger.mark_queued(&fp)?;
        ledger.begin_detecting(&fp)?;
        ledger.mark_succeeded(&fp)?;
        assert_eq!(ledger.get(&fp)?.unwrap().state, ProcessingState::Succeeded);
        Ok(())
    }

    #[test]
    fn crash_with_single_attempt_budget_is_not_dead_lettered() -> Result<()> {
        let clock = ManualClock::new(0);
        let ledger = DedupLedger::in_memory(Arc::new(clock.clone()), 1);
        let ev = event(b"one shot", "s.jpg");
        ledger.admit(&ev)?;
        drive_to_detecting(&ledger, &ev.fingerprint);

        // Restarting repeatedly mid-detection never exhausts the budget.
        for _ in 0..3 {
            let tasks = ledger.recover(|_| 0)?;
            assert_eq!(tasks.len(), 1);
            assert_eq!(ledger.get(&ev.fingerprint)?.unwrap().state, ProcessingState::Pending);
            drive_to_detecting(&ledger, &ev.fingerprint);
        }
        assert_eq!(ledger.get(&ev.fingerprint)?.unwrap().attempts, 0);
        assert!(ledger.records(Some(ProcessingState::DeadLettered))?.is_empty());
        Ok(())
    }

    #[test]
    fn release_requeues_without_consuming_an_attempt() -> Result<()> {
        let clock = ManualClock::new(200);
        let ledger = ledger(&clock);
        let ev = event(b"stuck", "s.jpg");
        ledger.admit(&ev)?;
        let fp = ev.fingerprint;

        assert_eq!(ledger.release(&fp, ErrorKind::PersistenceIo, 50)?, None);
        drive_to_detecting(&ledger, &fp);
        let task = ledger.release(&fp, ErrorKind::PersistenceIo, 50)?.unwrap();
        assert_eq!(task.next_attempt_ms, 250);
        assert_eq!(ledger.retry_task(&fp)?, Some(task));
        let record = ledger.get(&fp)?.unwrap();
        assert_eq!(record.state, ProcessingState::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.last_error, Some(ErrorKind::PersistenceIo));
        Ok(())
    }

    #[test]
    fn concurrent_admissions_yield_one_claim() -> Result<()> {
        const THREADS: usize = 8;
        let clock = ManualClock::new(0);
        let ledger = Arc::new(ledger(&clock));
        let barrier = std::sync::Barrier::new(THREADS);

        let results: Vec<(bool, bool)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|i| {
                    let ledger = ledger.clone();
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let ev = event(b"raced", &format!("IMG_{}.jpg", i));
                        barrier.wait();
                        let accepted =
                            matches!(ledger.admit(&ev).unwrap(), Admission::Accepted(_));
                        ledger.mark_queued(&ev.fingerprint).unwrap();
                        let claimed = ledger.begin_detecting(&ev.fingerprint).unwrap().is_some();
                        (accepted, claimed)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|(accepted, _)| *accepted).count(), 1);
        assert_eq!(results.iter().filter(|(_, claimed)| *claimed).count(), 1);
        let records = ledger.records(None)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ProcessingState::Detecting);
        Ok(())
    }
}
