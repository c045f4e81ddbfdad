//! Training-time data augmentation.
//!
//! Mirrors the three Keras preprocessing layers the experiments use:
//! `RandomFlip`, `RandomRotation` and `RandomZoom`. Layers run in that order.

use std::f32::consts::PI;

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::Rng;
use serde::{Deserialize, Serialize};

const FILL: Rgb<u8> = Rgb([0, 0, 0]);

/// `data_aug_layer` section of an experiment config. Every layer is optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DataAugConfig {
    pub random_flip: Option<RandomFlipConfig>,
    pub random_rotation: Option<RandomRotationConfig>,
    pub random_zoom: Option<RandomZoomConfig>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlipMode {
    Horizontal,
    Vertical,
    #[default]
    HorizontalAndVertical,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RandomFlipConfig {
    #[serde(default)]
    pub mode: FlipMode,
}

/// Either `f` (meaning `[-f, f]`) or an explicit `[lower, upper]`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Factor {
    Symmetric(f32),
    Range([f32; 2]),
}

impl Factor {
    pub fn bounds(&self) -> (f32, f32) {
        match *self {
            Factor::Symmetric(f) => (-f.abs(), f.abs()),
            Factor::Range([lower, upper]) => (lower, upper),
        }
    }

    fn validate(&self, what: &str, min: f32) -> Result<()> {
        let (lower, upper) = self.bounds();
        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            bail!("{} range [{}, {}] is invalid", what, lower, upper);
        }
        if lower <= min {
            bail!("{} lower bound {} must be greater than {}", what, lower, min);
        }
        Ok(())
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> f32 {
        let (lower, upper) = self.bounds();
        if lower == upper {
            lower
        } else {
            rng.gen_range(lower..=upper)
        }
    }
}

/// Rotation by a random fraction of a full turn.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RandomRotationConfig {
    pub factor: Factor,
}

/// Zoom by a random factor; negative zooms in, positive zooms out.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RandomZoomConfig {
    pub height_factor: Factor,
    /// Defaults to `height_factor` (aspect ratio preserved).
    pub width_factor: Option<Factor>,
}

impl DataAugConfig {
    pub fn is_empty(&self) -> bool {
        self.random_flip.is_none() && self.random_rotation.is_none() && self.random_zoom.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(rotation) = &self.random_rotation {
            rotation.factor.validate("random_rotation.factor", f32::NEG_INFINITY)?;
        }
        if let Some(zoom) = &self.random_zoom {
            zoom.height_factor.validate("random_zoom.height_factor", -1.0)?;
            if let Some(width) = &zoom.width_factor {
                width.validate("random_zoom.width_factor", -1.0)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Layer {
    Flip(FlipMode),
    Rotation(Factor),
    Zoom {
        height: Factor,
        width: Option<Factor>,
    },
}

/// Ordered augmentation pipeline built from a [`DataAugConfig`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Augmentation {
    layers: Vec<Layer>,
}

impl Augmentation {
    pub fn from_config(config: &DataAugConfig) -> Result<Self> {
        config.validate()?;
        let mut layers = Vec::new();
        if let Some(flip) = &config.random_flip {
            layers.push(Layer::Flip(flip.mode));
        }
        if let Some(rotation) = &config.random_rotation {
            layers.push(Layer::Rotation(rotation.factor));
        }
        if let Some(zoom) = &config.random_zoom {
            layers.push(Layer::Zoom {
                height: zoom.height_factor,
                width: zoom.width_factor,
            });
        }
        Ok(Self { layers })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Apply every layer once. Output has the input's dimensions.
    pub fn apply<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let mut out = image.clone();
        for layer in &self.layers {
            out = match layer {
                Layer::Flip(mode) => random_flip(out, *mode, rng),
                Layer::Rotation(factor) => {
                    let theta = factor.sample(rng) * 2.0 * PI;
                    rotate_about_center(&out, theta, Interpolation::Bilinear, FILL)
                }
                Layer::Zoom { height, width } => {
                    let zy = height.sample(rng);
                    // Without a width factor both axes share one draw.
                    let zx = match width {
                        Some(width) => width.sample(rng),
                        None => zy,
                    };
                    zoom(&out, 1.0 + zy, 1.0 + zx)
                }
            };
        }
        out
    }
}

fn random_flip<R: Rng>(mut image: RgbImage, mode: FlipMode, rng: &mut R) -> RgbImage {
    let horizontal = matches!(mode, FlipMode::Horizontal | FlipMode::HorizontalAndVertical);
    let vertical = matches!(mode, FlipMode::Vertical | FlipMode::HorizontalAndVertical);
    if horizontal && rng.gen_bool(0.5) {
        imageops::flip_horizontal_in_place(&mut image);
    }
    if vertical && rng.gen_bool(0.5) {
        imageops::flip_vertical_in_place(&mut image);
    }
    image
}

/// Scale content by `1 / zy`, `1 / zx` about the centre, keeping the canvas size.
///
/// Each axis is handled on its own: a factor below 1 crops the centre of that
/// axis and stretches it, above 1 shrinks it onto a black canvas.
pub(crate) fn zoom(image: &RgbImage, zy: f32, zx: f32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let (src_x, src_w, dst_x, dst_w) = zoom_axis(w, zx);
    let (src_y, src_h, dst_y, dst_h) = zoom_axis(h, zy);

    let window = imageops::crop_imm(image, src_x, src_y, src_w, src_h).to_image();
    let scaled = imageops::resize(&window, dst_w, dst_h, FilterType::Triangle);
    if dst_w == w && dst_h == h {
        return scaled;
    }
    let mut canvas = RgbImage::from_pixel(w, h, FILL);
    imageops::overlay(&mut canvas, &scaled, dst_x as i64, dst_y as i64);
    canvas
}

/// `(source offset, source length, target offset, target length)` along one axis.
fn zoom_axis(size: u32, factor: f32) -> (u32, u32, u32, u32) {
    let window = ((size as f32 * factor).round() as u32).max(1);
    if window <= size {
        ((size - window) / 2, window, 0, size)
    } else {
        let len = ((size as f32 * size as f32 / window as f32).round() as u32).clamp(1, size);
        (0, size, (size - len) / 2, len)
    }
}
