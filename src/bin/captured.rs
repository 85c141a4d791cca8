//! captured - capture folder detection daemon
//!
//! This daemon:
//! 1. Loads configuration (`CAPTURE_CONFIG` file plus `CAPTURE_*` overrides)
//! 2. Opens the ledger and reloads unfinished work from the last run
//! 3. Watches the capture folder and runs detection on each new image
//! 4. Publishes annotated images and results under the output directory
//! 5. Stops on Ctrl-C, leaving queued and scheduled work in the ledger

use anyhow::{Context, Result};
use std::sync::mpsc;
use std::sync::Arc;

use capture_pipeline::{
    config::PipelineConfig, watcher::ensure_folder, BackendRegistry, Clock, DedupLedger,
    FilesystemResultStore, HealthSink, LogHealthSink, Pipeline, SystemClock,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = PipelineConfig::load()?;
    ensure_folder(&config.capture_folder).with_context(|| {
        format!(
            "cannot create capture folder {}",
            config.capture_folder.display()
        )
    })?;

    let mut registry = BackendRegistry::with_builtin(config.tract());
    registry.set_default(&config.backend.name)?;
    let factory = registry.default_factory()?;
    log::info!(
        "detector backend: {} (available: {})",
        config.backend.name,
        registry.list().join(", ")
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Arc::new(DedupLedger::open_sqlite(
        &config.db_path,
        clock.clone(),
        config.retry.max_attempts,
    )?);
    let store = FilesystemResultStore::open(&config.output_dir, &config.db_path)?;

    let pipeline = Pipeline::new(config.clone(), ledger, Box::new(store), factory, clock);
    pipeline.recover()?;
    let health_sink: Arc<dyn HealthSink> = Arc::new(LogHealthSink);
    let handle = pipeline.start(Some(health_sink))?;
    log::info!(
        "captured running: {} -> {}",
        config.capture_folder.display(),
        config.output_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("captured waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping pipeline...");
    let report = handle.shutdown()?;
    if report.abandoned_workers > 0 {
        log::warn!(
            "{} capture(s) were mid-detection and will be retried on next start",
            report.abandoned_workers
        );
    }
    Ok(())
}
