use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};

/// Stub backend for testing and model-less runs.
///
/// Returns the same scripted detections for every image. With no script it
/// reports nothing, which makes the region selector fall back to the full frame.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    detections: Vec<Detection>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            calls: 0,
        }
    }

    /// Number of images this backend has been asked to process.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<DetectionResult> {
        self.calls += 1;
        Ok(DetectionResult::new(self.detections.clone()))
    }
}
