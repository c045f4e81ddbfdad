//! Vehicle dataset preparation
//!
//! Tooling for a car-classification transfer-learning pipeline.
//!
//! # Architecture
//!
//! Three steps, each usable on its own:
//!
//! 1. **Split**: link every image listed in the labels table into
//!    `<output>/<subset>/<class>/<file>` ([`dataset`]).
//! 2. **Background removal**: run an object detector over the split tree, keep
//!    the largest car/truck and write the crop to a mirrored tree
//!    ([`background`], [`region`]).
//! 3. **Classifier**: pretrained backbone + dense softmax head with optional
//!    data augmentation ([`model`]).
//!
//! # Module Structure
//!
//! - `detect`: detector capability (`DetectorBackend`, stub and ONNX backends)
//! - `region`: vehicle bounding-box selection and cropping
//! - `dataset`: labels table and train/test split
//! - `background`: detector-driven crop of a dataset tree
//! - `model`: classifier assembly, preprocessing, augmentation
//! - `config`: runtime configuration (file + environment)

pub mod background;
pub mod config;
pub mod dataset;
pub mod detect;
pub mod model;
pub mod region;

pub use background::{BackgroundRemover, CroppedImage, RemovalStats};
pub use config::{DetectorSettings, PrepConfig};
pub use dataset::{
    split_dataset, split_dataset_from_path, LabelRow, LabelsTable, LinkMode, SplitOptions,
    SplitOutcome,
};
pub use detect::{BackendRegistry, Detection, DetectionResult, DetectorBackend, PixelBox, StubBackend};
pub use model::{Backbone, Classifier, ModelConfig, WeightSource};
pub use region::{
    crop_to_region, locate_vehicle, select_vehicle_region, CropBox, VehicleClasses,
    VehicleRegionSelector,
};
