use anyhow::Result;
use image::RgbImage;

use crate::detect::result::DetectionResult;

/// Object detector backend trait.
///
/// The region selector treats any implementation as an opaque capability:
/// image in, detections out. Implementations are expected to apply their own
/// confidence threshold and to report boxes in the pixel space of the image
/// they were given.
pub trait DetectorBackend {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on an RGB image.
    ///
    /// An empty result is not an error. Errors are reserved for the backend
    /// itself failing (bad model, inference failure) and are propagated by
    /// callers without retry.
    fn detect(&mut self, image: &RgbImage) -> Result<DetectionResult>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, image: &RgbImage) -> Result<DetectionResult> {
        (**self).detect(image)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
