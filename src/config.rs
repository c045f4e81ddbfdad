use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::dataset::LinkMode;
use crate::detect::{BackendRegistry, DetectorBackend, StubBackend};
use crate::region::VehicleClasses;

const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODEL_WIDTH: u32 = 640;
const DEFAULT_MODEL_HEIGHT: u32 = 640;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_UI_MODE: &str = "auto";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PrepConfigFile {
    detector: Option<DetectorConfigFile>,
    vehicle_classes: Option<Vec<u32>>,
    split: Option<SplitConfigFile>,
    ui: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    score_threshold: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SplitConfigFile {
    link_mode: Option<String>,
}

/// Runtime configuration shared by the preparation binaries.
#[derive(Debug, Clone)]
pub struct PrepConfig {
    pub detector: DetectorSettings,
    pub vehicle_classes: VehicleClasses,
    pub link_mode: LinkMode,
    pub ui: String,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Backend name: "stub" or "tract".
    pub backend: String,
    /// Set when the backend came from the config file or environment.
    pub backend_explicit: bool,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
}

impl DetectorSettings {
    /// Build the configured detector. Called once per run.
    pub fn build(&self) -> Result<Box<dyn DetectorBackend>> {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        if self.backend == "tract" {
            self.register_tract(&mut registry)?;
        }
        let mut backend = registry.take(&self.backend)?;
        backend.warm_up()?;
        Ok(backend)
    }

    /// Detector for background removal.
    ///
    /// The stub finds no vehicles, so it is only accepted when chosen explicitly.
    pub fn build_vehicle_detector(&self) -> Result<Box<dyn DetectorBackend>> {
        if self.backend == "stub" {
            if !self.backend_explicit {
                bail!(
                    "no vehicle detector configured: set VEHICLE_PREP_BACKEND=tract and \
                     VEHICLE_PREP_MODEL=<model.onnx> (VEHICLE_PREP_BACKEND=stub copies images uncropped)"
                );
            }
            log::warn!("stub detector selected: images will be written uncropped");
        }
        self.build()
    }

    #[cfg(feature = "backend-tract")]
    fn register_tract(&self, registry: &mut BackendRegistry) -> Result<()> {
        let model_path = self
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow!("detector backend 'tract' requires a model path"))?;
        let backend =
            crate::detect::TractBackend::new(model_path, self.input_width, self.input_height)?
                .with_threshold(self.score_threshold)
                .with_iou_threshold(self.iou_threshold);
        registry.register(backend);
        Ok(())
    }

    #[cfg(not(feature = "backend-tract"))]
    fn register_tract(&self, _registry: &mut BackendRegistry) -> Result<()> {
        Err(anyhow!(
            "detector backend 'tract' requires the backend-tract feature"
        ))
    }
}

impl PrepConfig {
    /// Defaults, then `$VEHICLE_PREP_CONFIG` (JSON), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VEHICLE_PREP_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PrepConfigFile) -> Result<Self> {
        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend_explicit: detector_file.backend.is_some(),
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model_path: detector_file.model_path,
            input_width: detector_file.input_width.unwrap_or(DEFAULT_MODEL_WIDTH),
            input_height: detector_file.input_height.unwrap_or(DEFAULT_MODEL_HEIGHT),
            score_threshold: detector_file
                .score_threshold
                .unwrap_or(DEFAULT_SCORE_THRESHOLD),
            iou_threshold: detector_file.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
        };
        let vehicle_classes = match file.vehicle_classes {
            Some(ids) => VehicleClasses::new(ids),
            None => VehicleClasses::coco(),
        };
        let link_mode = match file.split.and_then(|split| split.link_mode) {
            Some(mode) => LinkMode::parse(&mode)?,
            None => LinkMode::default(),
        };
        Ok(Self {
            detector,
            vehicle_classes,
            link_mode,
            ui: file.ui.unwrap_or_else(|| DEFAULT_UI_MODE.to_string()),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var("VEHICLE_PREP_BACKEND") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
                self.detector.backend_explicit = true;
            }
        }
        if let Ok(path) = std::env::var("VEHICLE_PREP_MODEL") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(threshold) = std::env::var("VEHICLE_PREP_SCORE_THRESHOLD") {
            self.detector.score_threshold = threshold.trim().parse().map_err(|_| {
                anyhow!("VEHICLE_PREP_SCORE_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Ok(classes) = std::env::var("VEHICLE_PREP_VEHICLE_CLASSES") {
            let ids = split_csv(&classes)
                .iter()
                .map(|id| {
                    id.parse::<u32>().map_err(|_| {
                        anyhow!("VEHICLE_PREP_VEHICLE_CLASSES must be comma-separated class ids")
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            if !ids.is_empty() {
                self.vehicle_classes = VehicleClasses::new(ids);
            }
        }
        if let Ok(mode) = std::env::var("VEHICLE_PREP_LINK_MODE") {
            if !mode.trim().is_empty() {
                self.link_mode = LinkMode::parse(&mode)?;
            }
        }
        if let Ok(ui) = std::env::var("VEHICLE_PREP_UI") {
            if !ui.trim().is_empty() {
                self.ui = ui.trim().to_string();
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detector.backend = self.detector.backend.to_lowercase();
        match self.detector.backend.as_str() {
            "stub" => {}
            "tract" => {
                if self.detector.model_path.is_none() {
                    return Err(anyhow!(
                        "detector backend 'tract' requires a model path (VEHICLE_PREP_MODEL)"
                    ));
                }
            }
            other => {
                return Err(anyhow!(
                    "unknown detector backend '{}' (expected stub or tract)",
                    other
                ))
            }
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("detector input size must be non-zero"));
        }
        for (name, value) in [
            ("score_threshold", self.detector.score_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0 and 1, got {}", name, value));
            }
        }
        if self.vehicle_classes.ids().is_empty() {
            return Err(anyhow!("vehicle class set must not be empty"));
        }
        if !matches!(self.ui.as_str(), "auto" | "plain" | "pretty") {
            return Err(anyhow!(
                "ui mode must be auto, plain or pretty, got '{}'",
                self.ui
            ));
        }
        Ok(())
    }
}

impl Default for PrepConfig {
    fn default() -> Self {
        Self {
            detector: DetectorSettings {
                backend: DEFAULT_BACKEND.to_string(),
                backend_explicit: false,
                model_path: None,
                input_width: DEFAULT_MODEL_WIDTH,
                input_height: DEFAULT_MODEL_HEIGHT,
                score_threshold: DEFAULT_SCORE_THRESHOLD,
                iou_threshold: DEFAULT_IOU_THRESHOLD,
            },
            vehicle_classes: VehicleClasses::coco(),
            link_mode: LinkMode::default(),
            ui: DEFAULT_UI_MODE.to_string(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<PrepConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let mut cfg = PrepConfig::from_file(PrepConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.detector.backend, "stub");
        assert_eq!(cfg.detector.score_threshold, 0.5);
        assert_eq!(cfg.vehicle_classes, VehicleClasses::coco());
        assert_eq!(cfg.link_mode, LinkMode::HardLink);
    }

    #[test]
    fn tract_backend_needs_model() {
        let file: PrepConfigFile =
            serde_json::from_str(r#"{ "detector": { "backend": "Tract" } }"#).unwrap();
        let mut cfg = PrepConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
        cfg.detector.model_path = Some(PathBuf::from("yolov8n.onnx"));
        cfg.validate().unwrap();
        assert_eq!(cfg.detector.backend, "tract");
    }

    #[test]
    fn rejects_bad_values() {
        for raw in [
            r#"{ "detector": { "backend": "detectron" } }"#,
            r#"{ "detector": { "score_threshold": 1.5 } }"#,
            r#"{ "vehicle_classes": [] }"#,
            r#"{ "ui": "fancy" }"#,
        ] {
            let file: PrepConfigFile = serde_json::from_str(raw).unwrap();
            let mut cfg = PrepConfig::from_file(file).unwrap();
            assert!(cfg.validate().is_err(), "{raw}");
        }
        assert!(serde_json::from_str::<PrepConfigFile>(r#"{ "threads": 4 }"#).is_err());
    }

    #[test]
    fn default_settings_build_stub_detector() {
        let detector = PrepConfig::default().detector.build().unwrap();
        assert_eq!(detector.name(), "stub");
    }

    #[test]
    fn implicit_stub_is_refused_for_cropping() {
        let err = PrepConfig::default()
            .detector
            .build_vehicle_detector()
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("VEHICLE_PREP_BACKEND"), "{err}");

        let file: PrepConfigFile =
            serde_json::from_str(r#"{ "detector": { "backend": "stub" } }"#).unwrap();
        let cfg = PrepConfig::from_file(file).unwrap();
        assert!(cfg.detector.backend_explicit);
        assert_eq!(cfg.detector.build_vehicle_detector().unwrap().name(), "stub");
    }

    #[test]
    fn split_csv_drops_blanks() {
        assert_eq!(split_csv(" 2, ,7,"), vec!["2", "7"]);
    }
}
