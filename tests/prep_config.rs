use std::sync::Mutex;

use tempfile::NamedTempFile;

use vehicle_prep::config::PrepConfig;
use vehicle_prep::{DetectorBackend, LinkMode, VehicleClasses};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VEHICLE_PREP_CONFIG",
        "VEHICLE_PREP_BACKEND",
        "VEHICLE_PREP_MODEL",
        "VEHICLE_PREP_SCORE_THRESHOLD",
        "VEHICLE_PREP_VEHICLE_CLASSES",
        "VEHICLE_PREP_LINK_MODE",
        "VEHICLE_PREP_UI",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "detector": {
            "backend": "stub",
            "model_path": "models/yolov8s.onnx",
            "input_width": 800,
            "input_height": 608,
            "score_threshold": 0.4
        },
        "vehicle_classes": [2, 5, 7],
        "split": { "link_mode": "copy" },
        "ui": "plain"
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("VEHICLE_PREP_CONFIG", file.path());
    std::env::set_var("VEHICLE_PREP_SCORE_THRESHOLD", "0.65");
    std::env::set_var("VEHICLE_PREP_VEHICLE_CLASSES", "7, 2");

    let cfg = PrepConfig::load().expect("load config");

    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(
        cfg.detector.model_path.as_deref(),
        Some(std::path::Path::new("models/yolov8s.onnx"))
    );
    assert_eq!(cfg.detector.input_width, 800);
    assert_eq!(cfg.detector.input_height, 608);
    assert_eq!(cfg.detector.score_threshold, 0.65);
    assert_eq!(cfg.vehicle_classes, VehicleClasses::coco());
    assert_eq!(cfg.link_mode, LinkMode::Copy);
    assert_eq!(cfg.ui, "plain");

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PrepConfig::load().expect("load config");
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.vehicle_classes.ids(), &[2, 7]);
    assert_eq!(cfg.link_mode, LinkMode::HardLink);
    assert_eq!(cfg.ui, "auto");

    clear_env();
}

#[test]
fn background_removal_needs_a_chosen_detector() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PrepConfig::load().expect("load config");
    let err = cfg.detector.build_vehicle_detector().err().expect("implicit stub");
    assert!(err.to_string().contains("VEHICLE_PREP_MODEL"), "{err}");

    std::env::set_var("VEHICLE_PREP_BACKEND", "stub");
    let cfg = PrepConfig::load().expect("load config");
    let detector = cfg.detector.build_vehicle_detector().expect("explicit stub");
    assert_eq!(detector.name(), "stub");

    clear_env();
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();

    for (key, value) in [
        ("VEHICLE_PREP_SCORE_THRESHOLD", "high"),
        ("VEHICLE_PREP_VEHICLE_CLASSES", "car,truck"),
        ("VEHICLE_PREP_LINK_MODE", "symlink"),
        ("VEHICLE_PREP_BACKEND", "detectron2"),
        ("VEHICLE_PREP_BACKEND", "tract"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(PrepConfig::load().is_err(), "{key}={value}");
    }

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VEHICLE_PREP_CONFIG", "/nonexistent/vehicle_prep.json");
    let err = PrepConfig::load().unwrap_err().to_string();
    assert!(err.contains("/nonexistent/vehicle_prep.json"), "{err}");

    clear_env();
}
