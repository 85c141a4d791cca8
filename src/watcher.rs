//! Capture folder watcher.
//!
//! Polls the folder the phone-sync service writes into and emits a
//! `CaptureEvent` for each image whose size and modification time have held
//! still for the quiet period. The watcher never runs inference and never
//! blocks on the work queue: when downstream has no room it simply leaves
//! the file unmarked and looks again next poll.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use crate::clock::Clock;
use crate::fingerprint::Fingerprint;
use crate::record::CaptureEvent;

pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub folder: PathBuf,
    pub quiet_period: Duration,
    pub poll_interval: Duration,
    /// Lowercase extensions without the dot.
    pub extensions: Vec<String>,
}

impl WatcherConfig {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            quiet_period: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1000),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Downstream of the watcher: the ledger gate and the work queue.
pub trait CaptureSink {
    /// How many events may be emitted right now.
    fn capacity(&self) -> usize;

    /// Returns false when the event could not be recorded; the watcher then
    /// offers the file again on its next poll.
    fn submit(&self, event: &CaptureEvent) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Observation {
    size: u64,
    modified_ms: u64,
    unchanged_since_ms: u64,
    emitted: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub candidates: usize,
    pub emitted: usize,
    /// Stable files held back because downstream was full.
    pub deferred: usize,
    pub errors: usize,
}

pub struct CaptureWatcher {
    config: WatcherConfig,
    clock: Arc<dyn Clock>,
    observations: HashMap<PathBuf, Observation>,
    folder_missing: bool,
}

impl CaptureWatcher {
    pub fn new(config: WatcherConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            observations: HashMap::new(),
            folder_missing: false,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.config.folder
    }

    /// Number of files currently being tracked.
    pub fn tracked(&self) -> usize {
        self.observations.len()
    }

    /// One observation pass. Emits at most `capacity` events.
    pub fn poll_once(&mut self, capacity: usize) -> (Vec<CaptureEvent>, PollStats) {
        let mut stats = PollStats::default();
        let mut events = Vec::new();
        let now = self.clock.now_ms();

        let entries = match std::fs::read_dir(&self.config.folder) {
            Ok(entries) => {
                if self.folder_missing {
                    log::info!("capture folder {} is available", self.config.folder.display());
                    self.folder_missing = false;
                }
                entries
            }
            Err(err) => {
                if !self.folder_missing {
                    log::warn!(
                        "capture folder {} unreadable: {}",
                        self.config.folder.display(),
                        err
                    );
                    self.folder_missing = true;
                }
                stats.errors += 1;
                self.observations.clear();
                return (events, stats);
            }
        };

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("capture folder entry unreadable: {}", err);
                    stats.errors += 1;
                    continue;
                }
            };
            let path = entry.path();
            if !self.is_candidate(&path) {
                continue;
            }
            let Some((size, modified_ms)) = stat(&path) else {
                continue;
            };
            seen.insert(path.clone());
            candidates.push((path, size, modified_ms));
        }
        // Vanished or renamed files start over if they reappear.
        self.observations.retain(|path, _| seen.contains(path));
        candidates.sort();
        stats.candidates = candidates.len();

        let quiet_ms = self.config.quiet_period.as_millis() as u64;
        for (path, size, modified_ms) in candidates {
            let observation = self.observations.entry(path.clone()).or_insert(Observation {
                size,
                modified_ms,
                unchanged_since_ms: now,
                emitted: false,
            });
            if observation.size != size || observation.modified_ms != modified_ms {
                *observation = Observation {
                    size,
                    modified_ms,
                    unchanged_since_ms: now,
                    emitted: false,
                };
                continue;
            }
            if observation.emitted || now.saturating_sub(observation.unchanged_since_ms) < quiet_ms {
                continue;
            }
            if events.len() >= capacity {
                stats.deferred += 1;
                continue;
            }

            let fingerprint = match Fingerprint::of_file(&path) {
                Ok(fp) => fp,
                Err(err) => {
                    log::debug!("capture {} dropped before hashing: {}", path.display(), err);
                    self.observations.remove(&path);
                    continue;
                }
            };
            // A write that landed while hashing invalidates the fingerprint.
            if stat(&path) != Some((size, modified_ms)) {
                self.observations.remove(&path);
                continue;
            }
            if let Some(observation) = self.observations.get_mut(&path) {
                observation.emitted = true;
            }
            events.push(CaptureEvent {
                path,
                size,
                modified_ms,
                fingerprint,
            });
        }
        stats.emitted = events.len();
        (events, stats)
    }

    /// Poll until `shutdown` is set. Filesystem errors are logged, never fatal.
    pub fn run(mut self, sink: &dyn CaptureSink, shutdown: &AtomicBool) {
        log::info!(
            "watching {} (poll {:?}, quiet period {:?})",
            self.config.folder.display(),
            self.config.poll_interval,
            self.config.quiet_period
        );
        while !shutdown.load(Ordering::SeqCst) {
            let (events, stats) = self.poll_once(sink.capacity());
            if stats.deferred > 0 {
                log::debug!("work queue full, holding back {} stable capture(s)", stats.deferred);
            }
            self.deliver(sink, events);
            sleep_unless_shutdown(self.config.poll_interval, shutdown);
        }
        log::info!("watcher stopped");
    }

    /// Hand events downstream, clearing the emitted marker of any the sink
    /// refused.
    pub fn deliver(&mut self, sink: &dyn CaptureSink, events: Vec<CaptureEvent>) {
        for event in events {
            if sink.submit(&event) {
                continue;
            }
            if let Some(observation) = self.observations.get_mut(&event.path) {
                observation.emitted = false;
            }
        }
    }

    fn is_candidate(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.config.extensions.iter().any(|allowed| *allowed == ext)
    }
}

fn stat(path: &Path) -> Option<(u64, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let modified_ms = meta
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Some((meta.len(), modified_ms))
}

pub(crate) fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
        let nap = remaining.min(step);
        std::thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
}

/// Ensure the capture folder exists before watching.
pub fn ensure_folder(folder: &Path) -> Result<()> {
    std::fs::create_dir_all(folder)?;
    Ok(())
}
