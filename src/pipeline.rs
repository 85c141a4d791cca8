//! Wiring of watcher, ledger, work queue, workers, retry timer and sink.
//!
//! Threads:
//! - one watcher, polling the capture folder
//! - `worker_pool_size` detection workers, each owning a backend instance
//! - one retry timer
//! - one health publisher
//!
//! The bounded queue carries fingerprints only; every worker re-reads the
//! ledger record, so the ledger stays the single source of truth.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::detect::{
    filter_detections, BackendFactory, CapturedImage, DetectionResult, DetectorBackend,
    FilterConfig,
};
use crate::error::StageError;
use crate::fingerprint::Fingerprint;
use crate::health::{HealthReporter, HealthSink, HealthSnapshot, Outcome, Stage};
use crate::ledger::{Admission, DedupLedger, FailureOutcome};
use crate::record::{CaptureEvent, ErrorKind, ProcessingRecord, ProcessingState, RetryTask};
use crate::retry::RetryScheduler;
use crate::sink::{ResultSink, ResultStore};
use crate::watcher::{sleep_unless_shutdown, CaptureSink, CaptureWatcher};

const WORKER_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    /// Queue at capacity; the record was parked with a retry task.
    Deferred(RetryTask),
    /// Record was not Pending; nothing to do.
    Skipped,
    /// Workers are gone; the record stays durable for the next start.
    Closed,
}

/// Non-blocking producer side of the work queue.
///
/// Producers (watcher intake and retry timer) are serialized so the
/// "is there room" check, the Pending -> Stabilizing transition and the
/// send happen as one step.
pub struct Dispatcher {
    tx: Sender<Fingerprint>,
    gate: Mutex<()>,
    capacity: usize,
    ledger: Arc<DedupLedger>,
    scheduler: Arc<RetryScheduler>,
    health: Arc<HealthReporter>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        capacity: usize,
        ledger: Arc<DedupLedger>,
        scheduler: Arc<RetryScheduler>,
        health: Arc<HealthReporter>,
        clock: Arc<dyn Clock>,
    ) -> (Self, Receiver<Fingerprint>) {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let dispatcher = Self {
            tx,
            gate: Mutex::new(()),
            capacity,
            ledger,
            scheduler,
            health,
            clock,
        };
        (dispatcher, rx)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.tx.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.tx.len())
    }

    pub fn dispatch(&self, fingerprint: &Fingerprint) -> Result<DispatchOutcome> {
        let _gate = self
            .gate
            .lock()
            .map_err(|_| anyhow!("dispatch gate poisoned"))?;
        if self.tx.is_full() {
            return self.defer(fingerprint);
        }
        if !self.ledger.mark_queued(fingerprint)? {
            return Ok(DispatchOutcome::Skipped);
        }
        match self.tx.try_send(*fingerprint) {
            Ok(()) => Ok(DispatchOutcome::Queued),
            Err(TrySendError::Full(_)) => self.defer(fingerprint),
            Err(TrySendError::Disconnected(_)) => {
                log::warn!(
                    "{}: work queue closed, left for recovery on next start",
                    fingerprint
                );
                Ok(DispatchOutcome::Closed)
            }
        }
    }

    fn defer(&self, fingerprint: &Fingerprint) -> Result<DispatchOutcome> {
        match self.park_unlocked(fingerprint)? {
            Some(task) => {
                log::warn!(
                    "work queue full ({} items), deferring {} until {}",
                    self.capacity,
                    fingerprint,
                    task.next_attempt_ms
                );
                self.health.record(Outcome::Backpressure);
                Ok(DispatchOutcome::Deferred(task))
            }
            None => Ok(DispatchOutcome::Skipped),
        }
    }

    /// Park a Pending or Stabilizing record on the retry timer, one base
    /// backoff from now. No attempt is consumed.
    pub fn park(&self, fingerprint: &Fingerprint) -> Result<Option<RetryTask>> {
        let _gate = self
            .gate
            .lock()
            .map_err(|_| anyhow!("dispatch gate poisoned"))?;
        self.park_unlocked(fingerprint)
    }

    fn park_unlocked(&self, fingerprint: &Fingerprint) -> Result<Option<RetryTask>> {
        let due = self
            .clock
            .now_ms()
            .saturating_add(self.scheduler.backoff().base_ms);
        let task = self.ledger.defer(fingerprint, due)?;
        if let Some(task) = task {
            self.scheduler.schedule(task);
        }
        Ok(task)
    }

    /// Retry-timer entry point. Ignores entries superseded by a later task.
    pub fn fire(&self, fingerprint: &Fingerprint) -> Result<DispatchOutcome> {
        if let Some(task) = self.ledger.retry_task(fingerprint)? {
            if task.next_attempt_ms > self.clock.now_ms() {
                return Ok(DispatchOutcome::Skipped);
            }
        }
        self.dispatch(fingerprint)
    }
}

/// Watcher-facing gate: ledger admission, then dispatch.
pub struct Intake {
    ledger: Arc<DedupLedger>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<RetryScheduler>,
    health: Arc<HealthReporter>,
}

impl Intake {
    pub fn new(
        ledger: Arc<DedupLedger>,
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<RetryScheduler>,
        health: Arc<HealthReporter>,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            scheduler,
            health,
        }
    }

    pub fn admit(&self, event: &CaptureEvent) -> Result<Admission> {
        let started = Instant::now();
        let admission = self.ledger.admit(event)?;
        self.health.record_latency(Stage::Ledger, started.elapsed());
        match &admission {
            Admission::Accepted(record) => {
                self.health.record(Outcome::Accepted);
                log::info!(
                    "accepted {} from {}",
                    record.fingerprint.short(),
                    event.path.display()
                );
                self.dispatch_or_park(&record.fingerprint)?;
            }
            Admission::Duplicate(state) => {
                self.health.record(Outcome::Duplicate);
                log::debug!(
                    "{} is a duplicate ({}), ignoring {}",
                    event.fingerprint.short(),
                    state.as_str(),
                    event.path.display()
                );
            }
            Admission::InFlight(state) => {
                self.health.record(Outcome::InFlight);
                if *state == ProcessingState::Pending
                    && self.ledger.retry_task(&event.fingerprint)?.is_none()
                {
                    log::warn!(
                        "{} was pending with nothing scheduled, dispatching",
                        event.fingerprint.short()
                    );
                    self.dispatch_or_park(&event.fingerprint)?;
                } else {
                    log::debug!(
                        "{} already in flight ({})",
                        event.fingerprint.short(),
                        state.as_str()
                    );
                }
            }
            Admission::RetryScheduled(task) => {
                self.health.record(Outcome::RetryScheduled);
                log::info!("{} re-captured, retry scheduled", event.fingerprint.short());
                self.scheduler.schedule(*task);
            }
        }
        Ok(admission)
    }

    /// Dispatch an admitted record; if that fails, park it on the retry
    /// timer so it is not left Pending with nothing scheduled.
    fn dispatch_or_park(&self, fingerprint: &Fingerprint) -> Result<()> {
        let err = match self.dispatcher.dispatch(fingerprint) {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        log::warn!("{}: dispatch failed, parking: {:#}", fingerprint, err);
        match self.dispatcher.park(fingerprint) {
            Ok(_) => Ok(()),
            Err(park_err) => Err(err.context(format!("parking failed too: {:#}", park_err))),
        }
    }
}

impl CaptureSink for Intake {
    fn capacity(&self) -> usize {
        self.dispatcher.remaining()
    }

    fn submit(&self, event: &CaptureEvent) -> bool {
        match self.admit(event) {
            Ok(_) => true,
            Err(err) => {
                self.health.record(Outcome::WatcherError);
                log::error!(
                    "admission failed for {} ({}): {:#}",
                    event.path.display(),
                    event.fingerprint,
                    err
                );
                false
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    Succeeded(DetectionResult),
    Retrying(RetryTask),
    DeadLettered(ErrorKind),
    /// Another path already claimed or finished the fingerprint.
    Skipped,
}

/// One detection attempt for one fingerprint, from claim to terminal mark.
pub struct DetectionPipeline {
    ledger: Arc<DedupLedger>,
    scheduler: Arc<RetryScheduler>,
    sink: Arc<ResultSink>,
    health: Arc<HealthReporter>,
    filter: FilterConfig,
}

impl DetectionPipeline {
    pub fn new(
        ledger: Arc<DedupLedger>,
        scheduler: Arc<RetryScheduler>,
        sink: Arc<ResultSink>,
        health: Arc<HealthReporter>,
        filter: FilterConfig,
    ) -> Self {
        Self {
            ledger,
            scheduler,
            sink,
            health,
            filter,
        }
    }

    pub fn process(
        &self,
        backend: &mut dyn DetectorBackend,
        fingerprint: &Fingerprint,
    ) -> Result<StepOutcome> {
        let started = Instant::now();
        let Some(record) = self.ledger.begin_detecting(fingerprint)? else {
            return Ok(StepOutcome::Skipped);
        };

        match self.run_stages(backend, &record, started) {
            Ok(result) => {
                self.health.record(Outcome::Succeeded);
                self.health.record_latency(Stage::EndToEnd, started.elapsed());
                log::info!(
                    "{}: {} detection(s) in {} ms",
                    fingerprint.short(),
                    result.detections.len(),
                    result.processing_ms
                );
                Ok(StepOutcome::Succeeded(result))
            }
            Err(err) if err.is_transient() => {
                log::warn!("{}: {}", fingerprint, err);
                if err.kind() == ErrorKind::PersistenceIo && self.result_stored(fingerprint) {
                    let cause = anyhow!("result stored but record not closed: {}", err);
                    return self.release(fingerprint, err.kind(), cause);
                }
                match self
                    .scheduler
                    .on_transient_failure(&self.ledger, fingerprint, err.kind())
                {
                    Ok(FailureOutcome::Retry(task)) => {
                        self.health.record(Outcome::Retried);
                        Ok(StepOutcome::Retrying(task))
                    }
                    Ok(FailureOutcome::DeadLettered) => {
                        self.health.record(Outcome::DeadLettered);
                        Ok(StepOutcome::DeadLettered(err.kind()))
                    }
                    Err(ledger_err) => self.release(fingerprint, err.kind(), ledger_err),
                }
            }
            Err(err) => {
                log::warn!("{}: {}, dead-lettered without retry", fingerprint, err);
                if let Err(ledger_err) = self.ledger.dead_letter(fingerprint, err.kind()) {
                    return self.release(fingerprint, err.kind(), ledger_err);
                }
                self.health.record(Outcome::ValidationFailed);
                self.health.record(Outcome::DeadLettered);
                Ok(StepOutcome::DeadLettered(err.kind()))
            }
        }
    }

    /// Put a claimed record back on the retry timer after its outcome could
    /// not be written. No attempt is consumed.
    fn release(
        &self,
        fingerprint: &Fingerprint,
        kind: ErrorKind,
        cause: anyhow::Error,
    ) -> Result<StepOutcome> {
        log::error!("{}: {:#}; releasing for retry", fingerprint, cause);
        let delay_ms = self.scheduler.backoff().base_ms;
        match self.ledger.release(fingerprint, kind, delay_ms) {
            Ok(Some(task)) => {
                self.scheduler.schedule(task);
                self.health.record(Outcome::Retried);
                Ok(StepOutcome::Retrying(task))
            }
            Ok(None) => Ok(StepOutcome::Skipped),
            Err(err) => Err(cause.context(format!("release failed: {:#}", err))),
        }
    }

    fn result_stored(&self, fingerprint: &Fingerprint) -> bool {
        matches!(self.sink.detection_result(fingerprint), Ok(Some(_)))
    }

    fn run_stages(
        &self,
        backend: &mut dyn DetectorBackend,
        record: &ProcessingRecord,
        started: Instant,
    ) -> Result<DetectionResult, StageError> {
        // An earlier attempt stored the result but never closed the record.
        if let Some(stored) = self
            .sink
            .detection_result(&record.fingerprint)
            .map_err(StageError::persistence)?
        {
            log::info!("{}: result already stored", record.fingerprint.short());
            self.sink.finish(&record.fingerprint)?;
            return Ok(stored);
        }

        let stage = Instant::now();
        let bytes = std::fs::read(&record.source_path).map_err(|err| {
            StageError::new(
                ErrorKind::Unreadable,
                format!("{}: {}", record.source_path.display(), err),
            )
        })?;
        if Fingerprint::of_bytes(&bytes) != record.fingerprint {
            return Err(StageError::new(
                ErrorKind::ContentChanged,
                format!("{} no longer holds this content", record.source_path.display()),
            ));
        }
        let image = CapturedImage::decode(bytes)?;
        self.health.record_latency(Stage::Decode, stage.elapsed());

        let stage = Instant::now();
        let raw = backend.detect(&image)?;
        self.health.record_latency(Stage::Inference, stage.elapsed());

        let stage = Instant::now();
        let detections = filter_detections(raw, &self.filter);
        self.health.record_latency(Stage::Filter, stage.elapsed());

        let stage = Instant::now();
        let result = self.sink.commit(record, &image, detections, started)?;
        self.health.record_latency(Stage::Sink, stage.elapsed());
        Ok(result)
    }
}

/// A composed, not yet running pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<DedupLedger>,
    scheduler: Arc<RetryScheduler>,
    health: Arc<HealthReporter>,
    dispatcher: Arc<Dispatcher>,
    receiver: Receiver<Fingerprint>,
    detection: Arc<DetectionPipeline>,
    sink: Arc<ResultSink>,
    factory: BackendFactory,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<DedupLedger>,
        store: Box<dyn ResultStore + Send>,
        factory: BackendFactory,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = Arc::new(RetryScheduler::new(config.backoff()));
        Self::with_scheduler(config, ledger, store, factory, clock, scheduler)
    }

    pub fn with_scheduler(
        config: PipelineConfig,
        ledger: Arc<DedupLedger>,
        store: Box<dyn ResultStore + Send>,
        factory: BackendFactory,
        clock: Arc<dyn Clock>,
        scheduler: Arc<RetryScheduler>,
    ) -> Self {
        let health = Arc::new(HealthReporter::new());
        let sink = Arc::new(ResultSink::new(
            store,
            ledger.clone(),
            clock.clone(),
            config.jpeg_quality,
        ));
        let (dispatcher, receiver) = Dispatcher::new(
            config.workers.queue_capacity,
            ledger.clone(),
            scheduler.clone(),
            health.clone(),
            clock.clone(),
        );
        let detection = Arc::new(DetectionPipeline::new(
            ledger.clone(),
            scheduler.clone(),
            sink.clone(),
            health.clone(),
            config.filter(),
        ));
        Self {
            config,
            clock,
            ledger,
            scheduler,
            health,
            dispatcher: Arc::new(dispatcher),
            receiver,
            detection,
            sink,
            factory,
        }
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }

    pub fn health(&self) -> &Arc<HealthReporter> {
        &self.health
    }

    pub fn sink(&self) -> &Arc<ResultSink> {
        &self.sink
    }

    /// Reload durable work left by a previous run into the retry timer.
    pub fn recover(&self) -> Result<usize> {
        let count = self.scheduler.recover(&self.ledger)?;
        if count > 0 {
            log::info!("recovered {} unfinished capture(s)", count);
        }
        Ok(count)
    }

    pub fn start(self, health_sink: Option<Arc<dyn HealthSink>>) -> Result<PipelineHandle> {
        let watcher_stop = Arc::new(AtomicBool::new(false));
        let workers_stop = Arc::new(AtomicBool::new(false));
        let timer_stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(self.config.workers.worker_pool_size);
        for id in 0..self.config.workers.worker_pool_size {
            let detection = self.detection.clone();
            let rx = self.receiver.clone();
            let factory = self.factory.clone();
            let stop = workers_stop.clone();
            let handle = thread::Builder::new()
                .name(format!("detect-{}", id))
                .spawn(move || worker_loop(id, detection, rx, factory, stop))
                .map_err(|e| anyhow!("failed to spawn worker {}: {}", id, e))?;
            workers.push(handle);
        }

        let timer = {
            let scheduler = self.scheduler.clone();
            let dispatcher = self.dispatcher.clone();
            let clock = self.clock.clone();
            let stop = timer_stop.clone();
            thread::Builder::new()
                .name("retry-timer".into())
                .spawn(move || {
                    scheduler.run(clock.as_ref(), &stop, |fingerprint| {
                        if let Err(err) = dispatcher.fire(&fingerprint) {
                            log::error!("retry dispatch failed for {}: {:#}", fingerprint, err);
                        }
                    })
                })
                .map_err(|e| anyhow!("failed to spawn retry timer: {}", e))?
        };

        let watcher = {
            let intake = Intake::new(
                self.ledger.clone(),
                self.dispatcher.clone(),
                self.scheduler.clone(),
                self.health.clone(),
            );
            let capture = CaptureWatcher::new(self.config.watcher(), self.clock.clone());
            let stop = watcher_stop.clone();
            thread::Builder::new()
                .name("capture-watcher".into())
                .spawn(move || capture.run(&intake, &stop))
                .map_err(|e| anyhow!("failed to spawn watcher: {}", e))?
        };

        let reporter = match health_sink {
            Some(health_sink) => {
                let health = self.health.clone();
                let dispatcher = self.dispatcher.clone();
                let scheduler = self.scheduler.clone();
                let stop = timer_stop.clone();
                let interval = self.config.health_interval;
                Some(
                    thread::Builder::new()
                        .name("health".into())
                        .spawn(move || {
                            while !stop.load(Ordering::SeqCst) {
                                sleep_unless_shutdown(interval, &stop);
                                health_sink.publish(&health.snapshot(
                                    dispatcher.depth(),
                                    dispatcher.capacity(),
                                    scheduler.pending(),
                                ));
                            }
                        })
                        .map_err(|e| anyhow!("failed to spawn health reporter: {}", e))?,
                )
            }
            None => None,
        };

        log::info!(
            "pipeline started: {} worker(s), queue capacity {}",
            workers.len(),
            self.dispatcher.capacity()
        );
        Ok(PipelineHandle {
            grace: self.config.workers.shutdown_grace,
            ledger: self.ledger,
            scheduler: self.scheduler,
            health: self.health,
            dispatcher: self.dispatcher,
            receiver: self.receiver,
            watcher_stop,
            workers_stop,
            timer_stop,
            watcher: Some(watcher),
            timer: Some(timer),
            reporter,
            workers,
        })
    }
}

fn worker_loop(
    id: usize,
    detection: Arc<DetectionPipeline>,
    rx: Receiver<Fingerprint>,
    factory: BackendFactory,
    stop: Arc<AtomicBool>,
) {
    let mut backend = match factory() {
        Ok(backend) => backend,
        Err(err) => {
            log::error!("worker {}: cannot create detector backend: {:#}", id, err);
            return;
        }
    };
    if let Err(err) = backend.warm_up() {
        log::warn!("worker {}: {} warm-up failed: {}", id, backend.name(), err);
    }
    log::debug!("worker {} ready with backend {}", id, backend.name());

    while !stop.load(Ordering::SeqCst) {
        let fingerprint = match rx.recv_timeout(WORKER_POLL) {
            Ok(fingerprint) => fingerprint,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(err) = detection.process(backend.as_mut(), &fingerprint) {
            log::error!("worker {}: {} left unresolved: {:#}", id, fingerprint, err);
        }
    }
    log::debug!("worker {} stopped", id);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued fingerprints parked back in the ledger.
    pub requeued: usize,
    /// Workers still running when the grace period ran out.
    pub abandoned_workers: usize,
}

pub struct PipelineHandle {
    grace: Duration,
    ledger: Arc<DedupLedger>,
    scheduler: Arc<RetryScheduler>,
    health: Arc<HealthReporter>,
    dispatcher: Arc<Dispatcher>,
    receiver: Receiver<Fingerprint>,
    watcher_stop: Arc<AtomicBool>,
    workers_stop: Arc<AtomicBool>,
    timer_stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.health.snapshot(
            self.dispatcher.depth(),
            self.dispatcher.capacity(),
            self.scheduler.pending(),
        )
    }

    /// Stop discovery, let in-flight work finish within the grace period,
    /// then stop the timer. Queued and scheduled work stays in the ledger.
    pub fn shutdown(mut self) -> Result<ShutdownReport> {
        log::info!("shutting down pipeline");
        self.watcher_stop.store(true, Ordering::SeqCst);
        join_named("watcher", self.watcher.take());

        // Stop the timer before draining so nothing re-enters the queue.
        self.timer_stop.store(true, Ordering::SeqCst);
        self.scheduler.notify();
        join_named("retry timer", self.timer.take());

        self.workers_stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.grace;
        while self.workers.iter().any(|w| !w.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let mut report = ShutdownReport::default();
        for worker in self.workers.drain(..) {
            if worker.is_finished() {
                if worker.join().is_err() {
                    log::error!("detection worker panicked");
                }
            } else {
                report.abandoned_workers += 1;
            }
        }
        if report.abandoned_workers > 0 {
            log::warn!(
                "{} worker(s) still busy after {:?}; their captures recover on next start",
                report.abandoned_workers,
                self.grace
            );
        }

        while let Ok(fingerprint) = self.receiver.try_recv() {
            match self.ledger.defer(&fingerprint, 0) {
                Ok(Some(_)) => report.requeued += 1,
                Ok(None) => {}
                Err(err) => log::error!("cannot park {}: {:#}", fingerprint, err),
            }
        }
        join_named("health reporter", self.reporter.take());
        log::info!(
            "pipeline stopped ({} queued capture(s) parked)",
            report.requeued
        );
        Ok(report)
    }
}

fn join_named(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            log::error!("{} thread panicked", name);
        }
    }
}
