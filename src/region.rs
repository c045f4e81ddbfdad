//! Vehicle region selection.
//!
//! Turns a detector's raw output for one image into exactly one integer crop
//! box: the largest car/truck detection, or the whole frame when there is none.

use anyhow::Result;
use image::{DynamicImage, RgbImage};

use crate::detect::{Detection, DetectionResult, DetectorBackend, PixelBox};

/// COCO category id for "car" (zero indexed, 80-class vocabulary).
pub const COCO_CAR: u32 = 2;
/// COCO category id for "truck".
pub const COCO_TRUCK: u32 = 7;

/// Category ids that count as a vehicle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VehicleClasses {
    ids: Vec<u32>,
}

impl VehicleClasses {
    /// The car + truck pair from the COCO label space.
    pub fn coco() -> Self {
        Self {
            ids: vec![COCO_CAR, COCO_TRUCK],
        }
    }

    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut ids: Vec<u32> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    pub fn contains(&self, class_id: u32) -> bool {
        self.ids.contains(&class_id)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }
}

impl Default for VehicleClasses {
    fn default() -> Self {
        Self::coco()
    }
}

/// Integer crop rectangle, usable directly as slice bounds.
///
/// Invariant: `left < right <= width`, `top < bottom <= height` for the image
/// it was derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CropBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropBox {
    /// Box covering the whole image.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_full(&self, width: u32, height: u32) -> bool {
        *self == Self::full(width, height)
    }

    /// `(left, top, right, bottom)`, a.k.a. `(x1, y1, x2, y2)`.
    pub fn as_tuple(&self) -> (u32, u32, u32, u32) {
        (self.left, self.top, self.right, self.bottom)
    }

    /// Clamp a detector box to the image and truncate to integers.
    ///
    /// Returns `None` when nothing of the box survives (non-finite values,
    /// zero width or height after clamping).
    pub fn from_pixel_box(bbox: &PixelBox, width: u32, height: u32) -> Option<Self> {
        let left = clamp_coord(bbox.left, width)?;
        let top = clamp_coord(bbox.top, height)?;
        let right = clamp_coord(bbox.right, width)?;
        let bottom = clamp_coord(bbox.bottom, height)?;
        if left >= right || top >= bottom {
            return None;
        }
        Some(Self {
            left,
            top,
            right,
            bottom,
        })
    }
}

fn clamp_coord(value: f32, limit: u32) -> Option<u32> {
    if !value.is_finite() {
        return None;
    }
    // `as` truncates toward zero, same as an integer cast of the tensor.
    Some(value.clamp(0.0, limit as f32) as u32)
}

/// Picks the primary vehicle region out of a detection result.
#[derive(Clone, Debug, Default)]
pub struct VehicleRegionSelector {
    classes: VehicleClasses,
}

impl VehicleRegionSelector {
    pub fn new(classes: VehicleClasses) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> &VehicleClasses {
        &self.classes
    }

    /// Largest vehicle detection, if any.
    ///
    /// Non-vehicle classes are dropped before areas are compared. Equal areas
    /// resolve to the earliest detection in detector output order.
    pub fn best_vehicle<'a>(
        &self,
        result: &'a DetectionResult,
        width: u32,
        height: u32,
    ) -> Option<(&'a Detection, CropBox)> {
        let mut best: Option<(&Detection, CropBox)> = None;
        for detection in result.iter() {
            if !self.classes.contains(detection.class_id) {
                continue;
            }
            let Some(crop) = CropBox::from_pixel_box(&detection.bbox, width, height) else {
                log::debug!(
                    "ignoring degenerate vehicle box {:?} for {}x{} image",
                    detection.bbox,
                    width,
                    height
                );
                continue;
            };
            match best {
                Some((_, current)) if crop.area() <= current.area() => {}
                _ => best = Some((detection, crop)),
            }
        }
        best
    }

    /// Crop box for the image: the largest vehicle, else the full frame.
    pub fn select(&self, result: &DetectionResult, width: u32, height: u32) -> CropBox {
        match self.best_vehicle(result, width, height) {
            Some((_, crop)) => crop,
            None => CropBox::full(width, height),
        }
    }
}

/// [`VehicleRegionSelector::select`] with the default car/truck classes.
pub fn select_vehicle_region(result: &DetectionResult, width: u32, height: u32) -> CropBox {
    VehicleRegionSelector::default().select(result, width, height)
}

/// Run the detector on `image` and select the vehicle region.
///
/// Detector failures propagate; an empty detection result does not.
pub fn locate_vehicle<D: DetectorBackend + ?Sized>(
    detector: &mut D,
    image: &RgbImage,
    selector: &VehicleRegionSelector,
) -> Result<CropBox> {
    let result = detector.detect(image)?;
    let (width, height) = image.dimensions();
    Ok(selector.select(&result, width, height))
}

/// Slice `image` to `region`.
pub fn crop_to_region(image: &DynamicImage, region: CropBox) -> DynamicImage {
    image.crop_imm(region.left, region.top, region.width(), region.height())
}
