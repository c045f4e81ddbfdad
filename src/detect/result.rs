/// Axis-aligned box in source-image pixel coordinates, as emitted by a detector.
///
/// Values are floats and may fall outside the image; the region selector clamps
/// them before they are used for cropping.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PixelBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl PixelBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Build from centre-format coordinates (YOLO style).
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            left: cx - w / 2.0,
            top: cy - h / 2.0,
            right: cx + w / 2.0,
            bottom: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection(&self, other: &PixelBox) -> f32 {
        let w = (self.right.min(other.right) - self.left.max(other.left)).max(0.0);
        let h = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &PixelBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        inter / union.max(1e-6)
    }

    /// Scale both axes independently (model input space -> source image space).
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            left: self.left * sx,
            top: self.top * sy,
            right: self.right * sx,
            bottom: self.bottom * sy,
        }
    }
}

/// One object reported by a detector.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Category id in the detector's label space (COCO, zero indexed).
    pub class_id: u32,
    pub bbox: PixelBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(class_id: u32, bbox: PixelBox, confidence: f32) -> Self {
        Self {
            class_id,
            bbox,
            confidence,
        }
    }
}

/// Result of running detection on a single image.
///
/// Detections are already filtered by the backend's confidence threshold.
/// Order is whatever the backend produced; consumers that need a stable rule
/// rely on that order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_format_converts_to_corners() {
        let b = PixelBox::from_center(50.0, 40.0, 20.0, 10.0);
        assert_eq!(b, PixelBox::new(40.0, 35.0, 60.0, 45.0));
        assert_eq!(b.area(), 200.0);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = PixelBox::new(0.0, 0.0, 10.0, 10.0);
        let b = PixelBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn inverted_box_has_no_area() {
        let b = PixelBox::new(10.0, 10.0, 5.0, 20.0);
        assert_eq!(b.area(), 0.0);
    }
}
