use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use capture_pipeline::config::PipelineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAPTURE_CONFIG",
        "CAPTURE_FOLDER",
        "CAPTURE_DB_PATH",
        "CAPTURE_OUTPUT_DIR",
        "CAPTURE_WORKERS",
        "CAPTURE_CONFIDENCE_THRESHOLD",
        "CAPTURE_IOU_THRESHOLD",
        "CAPTURE_BACKEND",
        "CAPTURE_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.capture_folder, PathBuf::from("data/captures"));
    assert_eq!(cfg.db_path, "data/pipeline.db");
    assert_eq!(cfg.detection.confidence_threshold, 0.3);
    assert_eq!(cfg.detection.iou_threshold, 0.5);
    assert_eq!(cfg.detection.max_detections, 10);
    assert_eq!(cfg.poll_interval, Duration::from_millis(1000));
    assert_eq!(cfg.retry.backoff_base_ms, 1000);
    assert_eq!(cfg.retry.backoff_cap_ms, 60000);
    assert_eq!(cfg.workers.worker_pool_size, 2);
    assert_eq!(cfg.backend.name, "stub");
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    let json = r#"{
        "capture_folder": "/srv/captures",
        "db_path": "/srv/pipeline.db",
        "extensions": ["JPG", ".png"],
        "stability_quiet_period_ms": 750,
        "detection": {
            "confidence_threshold": 0.45,
            "max_detections": 3,
            "classes_to_detect": ["mosquito"]
        },
        "retry": { "max_attempts": 7, "backoff_base_ms": 200, "backoff_cap_ms": 5000 },
        "workers": { "worker_pool_size": 4, "queue_capacity": 32 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("CAPTURE_WORKERS", "6");
    std::env::set_var("CAPTURE_IOU_THRESHOLD", "0.6");
    std::env::set_var("CAPTURE_OUTPUT_DIR", "/srv/out");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.capture_folder, PathBuf::from("/srv/captures"));
    assert_eq!(cfg.db_path, "/srv/pipeline.db");
    assert_eq!(cfg.output_dir, PathBuf::from("/srv/out"));
    assert_eq!(cfg.extensions, vec!["jpg", "png"]);
    assert_eq!(cfg.stability_quiet_period, Duration::from_millis(750));
    assert_eq!(cfg.detection.confidence_threshold, 0.45);
    assert_eq!(cfg.detection.iou_threshold, 0.6);
    assert_eq!(cfg.detection.max_detections, 3);
    assert_eq!(cfg.detection.classes_to_detect, vec!["mosquito"]);
    assert_eq!(cfg.retry.max_attempts, 7);
    assert_eq!(cfg.backoff().exponential_ms(3), 800);
    assert_eq!(cfg.workers.worker_pool_size, 6);
    assert_eq!(cfg.workers.queue_capacity, 32);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
capture_folder = "captures"
poll_interval_ms = 250

[backend]
name = "tract"
model_path = "models/yolov8n.onnx"
class_names = ["mosquito", "fly"]
"#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("CAPTURE_CONFIG", file.path());

    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.poll_interval, Duration::from_millis(250));
    assert_eq!(cfg.backend.name, "tract");
    let tract = cfg.tract().expect("model configured");
    assert_eq!(tract.model_path, PathBuf::from("models/yolov8n.onnx"));
    assert_eq!(tract.input_size, 640);
    assert_eq!(tract.class_name(1), "fly");
    assert_eq!(tract.class_name(5), "class_5");

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAPTURE_CONFIDENCE_THRESHOLD", "1.7");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("CAPTURE_WORKERS", "many");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("CAPTURE_WORKERS", "0");
    assert!(PipelineConfig::load().is_err());
    clear_env();
}
