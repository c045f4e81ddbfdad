#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult, PixelBox};

/// Default score threshold, matching the reference Faster R-CNN setup.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
/// IoU above which a lower-scored box of the same class is suppressed.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for ONNX object detectors.
///
/// Expects a YOLOv8-style export: one input `[1, 3, H, W]` (RGB, 0..1) and one
/// output `[1, 4 + classes, anchors]` where the first four rows are centre-format
/// boxes in model input pixels and the remaining rows are per-class scores.
/// Images of any size are resized to the model input and boxes are scaled back.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>,
    width: u32,
    height: u32,
    score_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "loaded detector {} ({}x{} input)",
            model_path.display(),
            width,
            height
        );

        Ok(Self {
            model,
            width,
            height,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the default score threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    /// Override the default NMS IoU threshold.
    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }
}

/// Turn raw `[1, 4 + classes, anchors]` output into source-image detections.
///
/// `sx`/`sy` map model input pixels back to the source image.
pub(crate) fn decode_output(
    outputs: TVec<TValue>,
    score_threshold: f32,
    iou_threshold: f32,
    sx: f32,
    sy: f32,
) -> Result<Vec<Detection>> {
    let output = outputs
        .first()
        .ok_or_else(|| anyhow!("model produced no outputs"))?;
    let view = output
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?;
    let shape = view.shape().to_vec();
    let view = view
        .into_dimensionality::<tract_ndarray::Ix3>()
        .ok()
        .filter(|v| v.shape()[0] == 1 && v.shape()[1] > 4)
        .ok_or_else(|| {
            anyhow!(
                "unexpected detector output shape {:?}, expected [1, 4 + classes, anchors]",
                shape
            )
        })?;
    let rows = shape[1];
    let anchors = shape[2];

    let mut candidates = Vec::new();
    for a in 0..anchors {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for row in 4..rows {
            let score = view[[0, row, a]];
            if score > best_score {
                best_score = score;
                best_class = row - 4;
            }
        }
        if !best_score.is_finite() || best_score < score_threshold {
            continue;
        }
        let bbox = PixelBox::from_center(
            view[[0, 0, a]],
            view[[0, 1, a]],
            view[[0, 2, a]],
            view[[0, 3, a]],
        )
        .scaled(sx, sy);
        candidates.push(Detection::new(best_class as u32, bbox, best_score));
    }

    Ok(non_max_suppression(candidates, iou_threshold))
}

/// Greedy per-class NMS. Output is ordered by descending confidence.
pub(crate) fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut suppressed = vec![false; candidates.len()];
    let mut kept = Vec::new();
    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if suppressed[j] || candidates[j].class_id != candidates[i].class_id {
                continue;
            }
            if candidates[i].bbox.iou(&candidates[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
        kept.push(candidates[i].clone());
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<DetectionResult> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(anyhow!("cannot run detection on an empty {}x{} image", w, h));
        }
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let sx = w as f32 / self.width as f32;
        let sy = h as f32 / self.height as f32;
        let detections =
            decode_output(outputs, self.score_threshold, self.iou_threshold, sx, sy)?;
        log::debug!("tract detector: {} detections", detections.len());
        Ok(DetectionResult::new(detections))
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.width, self.height);
        self.detect(&blank).map(|_| ())
    }
}
