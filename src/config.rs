use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{FilterConfig, TractConfig};
use crate::retry::Backoff;
use crate::watcher::{WatcherConfig, DEFAULT_EXTENSIONS};

const DEFAULT_CAPTURE_FOLDER: &str = "data/captures";
const DEFAULT_DB_PATH: &str = "data/pipeline.db";
const DEFAULT_OUTPUT_DIR: &str = "data/detections";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
const DEFAULT_MAX_DETECTIONS: usize = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_QUIET_PERIOD_MS: u64 = 500;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;
const DEFAULT_WORKER_POOL_SIZE: usize = 2;
const DEFAULT_QUEUE_CAPACITY: usize = 16;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    capture_folder: Option<PathBuf>,
    db_path: Option<String>,
    output_dir: Option<PathBuf>,
    extensions: Option<Vec<String>>,
    poll_interval_ms: Option<u64>,
    stability_quiet_period_ms: Option<u64>,
    detection: Option<DetectionConfigFile>,
    retry: Option<RetryConfigFile>,
    workers: Option<WorkerConfigFile>,
    backend: Option<BackendConfigFile>,
    health_interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    max_detections: Option<usize>,
    classes_to_detect: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryConfigFile {
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    worker_pool_size: Option<usize>,
    queue_capacity: Option<usize>,
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    name: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub capture_folder: PathBuf,
    pub db_path: String,
    pub output_dir: PathBuf,
    pub extensions: Vec<String>,
    pub poll_interval: Duration,
    pub stability_quiet_period: Duration,
    pub detection: DetectionSettings,
    pub retry: RetrySettings,
    pub workers: WorkerSettings,
    pub backend: BackendSettings,
    pub health_interval: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub classes_to_detect: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub worker_pool_size: usize,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    pub name: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub class_names: Vec<String>,
    pub timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // Defaults always pass validation.
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// File named by `CAPTURE_CONFIG` (TOML or JSON), then defaults, then
    /// `CAPTURE_*` environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Configuration rooted at one directory, for tests and embedding.
    pub fn rooted_at(root: &Path) -> Self {
        let mut cfg = Self::default();
        cfg.capture_folder = root.join("captures");
        cfg.db_path = root.join("pipeline.db").to_string_lossy().into_owned();
        cfg.output_dir = root.join("detections");
        cfg
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let detection = file.detection.unwrap_or_default();
        let retry = file.retry.unwrap_or_default();
        let workers = file.workers.unwrap_or_default();
        let backend = file.backend.unwrap_or_default();
        Self {
            capture_folder: file
                .capture_folder
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CAPTURE_FOLDER)),
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            extensions: file
                .extensions
                .map(|exts| normalize_extensions(&exts))
                .unwrap_or_else(|| DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()),
            poll_interval: Duration::from_millis(
                file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            stability_quiet_period: Duration::from_millis(
                file.stability_quiet_period_ms
                    .unwrap_or(DEFAULT_QUIET_PERIOD_MS),
            ),
            detection: DetectionSettings {
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                iou_threshold: detection.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
                max_detections: detection.max_detections.unwrap_or(DEFAULT_MAX_DETECTIONS),
                classes_to_detect: detection.classes_to_detect.unwrap_or_default(),
            },
            retry: RetrySettings {
                max_attempts: retry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                backoff_base_ms: retry.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
                backoff_cap_ms: retry.backoff_cap_ms.unwrap_or(DEFAULT_BACKOFF_CAP_MS),
            },
            workers: WorkerSettings {
                worker_pool_size: workers
                    .worker_pool_size
                    .unwrap_or(DEFAULT_WORKER_POOL_SIZE),
                queue_capacity: workers.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                shutdown_grace: Duration::from_millis(
                    workers.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
                ),
            },
            backend: BackendSettings {
                name: backend.name.unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: backend.model_path,
                input_size: backend.input_size.unwrap_or(DEFAULT_MODEL_INPUT_SIZE),
                class_names: backend.class_names.unwrap_or_default(),
                timeout_ms: backend.timeout_ms,
            },
            health_interval: Duration::from_millis(
                file.health_interval_ms.unwrap_or(DEFAULT_HEALTH_INTERVAL_MS),
            ),
            jpeg_quality: file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(folder) = env_nonempty("CAPTURE_FOLDER") {
            self.capture_folder = PathBuf::from(folder);
        }
        if let Some(db_path) = env_nonempty("CAPTURE_DB_PATH") {
            self.db_path = db_path;
        }
        if let Some(dir) = env_nonempty("CAPTURE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(workers) = env_nonempty("CAPTURE_WORKERS") {
            self.workers.worker_pool_size = workers
                .parse()
                .map_err(|_| anyhow!("CAPTURE_WORKERS must be a positive integer"))?;
        }
        if let Some(value) = env_nonempty("CAPTURE_CONFIDENCE_THRESHOLD") {
            self.detection.confidence_threshold = value
                .parse()
                .map_err(|_| anyhow!("CAPTURE_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Some(value) = env_nonempty("CAPTURE_IOU_THRESHOLD") {
            self.detection.iou_threshold = value
                .parse()
                .map_err(|_| anyhow!("CAPTURE_IOU_THRESHOLD must be a number"))?;
        }
        if let Some(name) = env_nonempty("CAPTURE_BACKEND") {
            self.backend.name = name;
        }
        if let Some(path) = env_nonempty("CAPTURE_MODEL_PATH") {
            self.backend.model_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.detection.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0, 1]"));
        }
        if !unit.contains(&self.detection.iou_threshold) {
            return Err(anyhow!("iou_threshold must be within [0, 1]"));
        }
        if self.workers.worker_pool_size == 0 {
            return Err(anyhow!("worker_pool_size must be at least 1"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be at least 1"));
        }
        if self.retry.backoff_base_ms == 0 {
            return Err(anyhow!("backoff_base_ms must be greater than zero"));
        }
        if self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            return Err(anyhow!("backoff_cap_ms must not be below backoff_base_ms"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval_ms must be greater than zero"));
        }
        if self.capture_folder.as_os_str().is_empty() {
            return Err(anyhow!("capture_folder must not be empty"));
        }
        if self.extensions.is_empty() {
            return Err(anyhow!("at least one image extension is required"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        Ok(())
    }

    pub fn watcher(&self) -> WatcherConfig {
        WatcherConfig {
            folder: self.capture_folder.clone(),
            quiet_period: self.stability_quiet_period,
            poll_interval: self.poll_interval,
            extensions: self.extensions.clone(),
        }
    }

    pub fn filter(&self) -> FilterConfig {
        FilterConfig {
            confidence_threshold: self.detection.confidence_threshold,
            iou_threshold: self.detection.iou_threshold,
            max_detections: Some(self.detection.max_detections),
            classes: self.detection.classes_to_detect.clone(),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry.backoff_base_ms, self.retry.backoff_cap_ms)
    }

    /// Model settings, when a model path is configured.
    pub fn tract(&self) -> Option<TractConfig> {
        self.backend.model_path.as_ref().map(|path| TractConfig {
            model_path: path.clone(),
            input_size: self.backend.input_size,
            class_names: self.backend.class_names.clone(),
            timeout_ms: self.backend.timeout_ms,
        })
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_extensions(exts: &[String]) -> Vec<String> {
    exts.iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.detection.confidence_threshold, 0.3);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.stability_quiet_period, Duration::from_millis(500));
        assert_eq!(cfg.extensions, vec!["jpg", "jpeg", "png", "bmp"]);
        assert!(cfg.tract().is_none());
    }

    #[test]
    fn extensions_are_normalized() {
        assert_eq!(
            normalize_extensions(&[".JPG".into(), " png ".into(), "".into()]),
            vec!["jpg", "png"]
        );
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = PipelineConfig::default();
        cfg.detection.iou_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.retry.backoff_cap_ms = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.workers.worker_pool_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.jpeg_quality = 0;
        assert!(cfg.validate().is_err());
    }
}
