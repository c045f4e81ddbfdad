//! Car classifier assembly.
//!
//! A pretrained [`Backbone`] produces a pooled embedding; a small
//! [`ClassifierHead`] (dropout + dense softmax with L2 kernel regularization)
//! maps it to class probabilities. Training loops are out of scope: this module
//! wires the pieces, initialises or restores the head and runs inference.
//!
//! Two weight sources are supported:
//!
//! - `weights = "imagenet"`: load the pretrained backbone named by `backbone`
//!   and put a freshly initialised head with `classes` outputs on top.
//! - `weights = "<dir>"`: restore a fine-tuned model saved with
//!   [`Classifier::save`]. Input shape, classes and augmentation come from the
//!   saved model; the corresponding config keys are ignored.

mod augment;
mod backbone;
mod head;
mod preprocess;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub use augment::{
    Augmentation, DataAugConfig, Factor, FlipMode, RandomFlipConfig, RandomRotationConfig,
    RandomZoomConfig,
};
pub use backbone::{Backbone, MeanPoolBackbone};
#[cfg(feature = "backend-tract")]
pub use backbone::TractBackbone;
pub use head::{dropout, softmax, ClassifierHead};
pub use preprocess::{resnet50_input, IMAGENET_BGR_MEAN};

/// `weights` value that selects generic pretrained weights.
pub const PRETRAINED_WEIGHTS: &str = "imagenet";
/// File names inside a fine-tuned model directory.
pub const SAVED_MODEL_FILE: &str = "model.json";
pub const SAVED_BACKBONE_FILE: &str = "backbone.onnx";

const MIN_INPUT_SIDE: u32 = 32;
const DEFAULT_L2_FACTOR: f32 = 0.01;

/// Model input shape as `(height, width, channels)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 3]", into = "[u32; 3]")]
pub struct InputShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl Default for InputShape {
    fn default() -> Self {
        Self {
            height: 224,
            width: 224,
            channels: 3,
        }
    }
}

impl From<[u32; 3]> for InputShape {
    fn from([height, width, channels]: [u32; 3]) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }
}

impl From<InputShape> for [u32; 3] {
    fn from(shape: InputShape) -> Self {
        [shape.height, shape.width, shape.channels]
    }
}

impl InputShape {
    pub fn validate(&self) -> Result<()> {
        if self.channels != 3 {
            bail!("input_shape must have 3 channels, got {}", self.channels);
        }
        if self.height < MIN_INPUT_SIDE || self.width < MIN_INPUT_SIDE {
            bail!(
                "input_shape {}x{} is smaller than the {}px minimum",
                self.height,
                self.width,
                MIN_INPUT_SIDE
            );
        }
        Ok(())
    }
}

/// Where the classifier's weights come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WeightSource {
    Pretrained { backbone: PathBuf },
    FineTuned { dir: PathBuf },
}

fn default_weights() -> String {
    PRETRAINED_WEIGHTS.to_string()
}

fn default_l2_factor() -> f32 {
    DEFAULT_L2_FACTOR
}

/// Model section of an experiment config (TOML).
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default = "default_weights")]
    pub weights: String,
    /// Pretrained backbone model file; required with `weights = "imagenet"`.
    pub backbone: Option<PathBuf>,
    #[serde(default)]
    pub input_shape: InputShape,
    #[serde(default)]
    pub dropout_rate: f32,
    pub data_aug_layer: Option<DataAugConfig>,
    pub classes: Option<usize>,
    #[serde(default = "default_l2_factor")]
    pub l2_factor: f32,
    /// Seed for head initialisation; random when absent.
    pub seed: Option<u64>,
}

impl ModelConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw).map_err(|e| anyhow!("invalid model config: {}", e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    pub fn weight_source(&self) -> Result<WeightSource> {
        if self.weights == PRETRAINED_WEIGHTS {
            let backbone = self
                .backbone
                .clone()
                .ok_or_else(|| anyhow!("weights = \"imagenet\" requires a backbone path"))?;
            Ok(WeightSource::Pretrained { backbone })
        } else if self.weights.trim().is_empty() {
            Err(anyhow!("weights must be \"imagenet\" or a model directory"))
        } else {
            Ok(WeightSource::FineTuned {
                dir: PathBuf::from(&self.weights),
            })
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let WeightSource::Pretrained { .. } = self.weight_source()? {
            self.input_shape.validate()?;
            match self.classes {
                Some(classes) if classes >= 1 => {}
                _ => bail!("classes must be at least 1 when training from pretrained weights"),
            }
            if let Some(aug) = &self.data_aug_layer {
                aug.validate()?;
            }
        }
        validate_dropout(self.dropout_rate)?;
        if !self.l2_factor.is_finite() || self.l2_factor < 0.0 {
            bail!("l2_factor must be a non-negative number");
        }
        Ok(())
    }
}

fn validate_dropout(rate: f32) -> Result<()> {
    if !(0.0..1.0).contains(&rate) {
        bail!("dropout_rate must be in [0, 1), got {}", rate);
    }
    Ok(())
}

/// On-disk description of a fine-tuned model, next to its backbone file.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SavedModel {
    input_shape: InputShape,
    dropout_rate: f32,
    l2_factor: f32,
    data_aug_layer: Option<DataAugConfig>,
    head: ClassifierHead,
}

/// Backbone + head, ready for inference.
pub struct Classifier {
    backbone: Box<dyn Backbone>,
    backbone_path: Option<PathBuf>,
    head: ClassifierHead,
    input_shape: InputShape,
    dropout_rate: f32,
    l2_factor: f32,
    data_aug_layer: Option<DataAugConfig>,
    augmentation: Augmentation,
}

impl Classifier {
    /// Build a classifier from config.
    ///
    /// `load_backbone` turns a backbone file into a [`Backbone`]; binaries pass a
    /// tract loader, tests pass something lighter.
    pub fn create<F>(config: &ModelConfig, mut load_backbone: F) -> Result<Self>
    where
        F: FnMut(&Path, InputShape) -> Result<Box<dyn Backbone>>,
    {
        config.validate()?;
        match config.weight_source()? {
            WeightSource::Pretrained { backbone: path } => {
                let backbone = load_backbone(&path, config.input_shape)?;
                let classes = config
                    .classes
                    .ok_or_else(|| anyhow!("classes must be set for pretrained weights"))?;
                let mut rng = match config.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                let head = ClassifierHead::glorot_uniform(backbone.embedding_len(), classes, &mut rng);
                log::info!(
                    "new classifier: backbone '{}' ({} features) -> {} classes",
                    backbone.name(),
                    backbone.embedding_len(),
                    classes
                );
                Self::assemble(
                    backbone,
                    Some(path),
                    head,
                    config.input_shape,
                    config.dropout_rate,
                    config.l2_factor,
                    config.data_aug_layer.clone(),
                )
            }
            WeightSource::FineTuned { dir } => Self::load(&dir, load_backbone),
        }
    }

    /// Restore a model written by [`Classifier::save`].
    pub fn load<F>(dir: &Path, mut load_backbone: F) -> Result<Self>
    where
        F: FnMut(&Path, InputShape) -> Result<Box<dyn Backbone>>,
    {
        let model_path = dir.join(SAVED_MODEL_FILE);
        let raw = fs::read_to_string(&model_path)
            .with_context(|| format!("failed to read fine-tuned model {}", model_path.display()))?;
        let saved: SavedModel = serde_json::from_str(&raw)
            .with_context(|| format!("invalid fine-tuned model {}", model_path.display()))?;
        let head = saved.head.validated()?;
        let backbone_path = dir.join(SAVED_BACKBONE_FILE);
        let backbone = load_backbone(&backbone_path, saved.input_shape)?;
        log::info!(
            "restored classifier from {} ({} classes)",
            dir.display(),
            head.classes()
        );
        Self::assemble(
            backbone,
            Some(backbone_path),
            head,
            saved.input_shape,
            saved.dropout_rate,
            saved.l2_factor,
            saved.data_aug_layer,
        )
    }

    fn assemble(
        backbone: Box<dyn Backbone>,
        backbone_path: Option<PathBuf>,
        head: ClassifierHead,
        input_shape: InputShape,
        dropout_rate: f32,
        l2_factor: f32,
        data_aug_layer: Option<DataAugConfig>,
    ) -> Result<Self> {
        input_shape.validate()?;
        validate_dropout(dropout_rate)?;
        if backbone.embedding_len() != head.embedding_len() {
            bail!(
                "backbone '{}' yields {} features but the head expects {}",
                backbone.name(),
                backbone.embedding_len(),
                head.embedding_len()
            );
        }
        let augmentation = match &data_aug_layer {
            Some(cfg) => Augmentation::from_config(cfg)?,
            None => Augmentation::default(),
        };
        Ok(Self {
            backbone,
            backbone_path,
            head,
            input_shape,
            dropout_rate,
            l2_factor,
            data_aug_layer,
            augmentation,
        })
    }

    pub fn classes(&self) -> usize {
        self.head.classes()
    }

    pub fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    pub fn dropout_rate(&self) -> f32 {
        self.dropout_rate
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    pub fn augmentation(&self) -> &Augmentation {
        &self.augmentation
    }

    fn embed(&mut self, image: &RgbImage) -> Result<Vec<f32>> {
        let input = resnet50_input(image, self.input_shape.width, self.input_shape.height);
        self.backbone.embed(&input)
    }

    /// Class probabilities for `image`. No augmentation, no dropout.
    pub fn predict(&mut self, image: &RgbImage) -> Result<Vec<f32>> {
        let embedding = self.embed(image)?;
        self.head.forward(&embedding)
    }

    /// Index and probability of the most likely class.
    pub fn top1(&mut self, image: &RgbImage) -> Result<(usize, f32)> {
        let probs = self.predict(image)?;
        probs
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| anyhow!("classifier produced no classes"))
    }

    /// Training-mode forward pass: augmentation and dropout active.
    pub fn forward_training<R: Rng>(&mut self, image: &RgbImage, rng: &mut R) -> Result<Vec<f32>> {
        let augmented = self.augmentation.apply(image, rng);
        let mut embedding = self.embed(&augmented)?;
        dropout(&mut embedding, self.dropout_rate, rng);
        self.head.forward(&embedding)
    }

    /// L2 kernel regularization term of the head.
    pub fn regularization_loss(&self) -> f32 {
        self.head.l2_penalty(self.l2_factor)
    }

    /// Write `model.json` (and a copy of the backbone) into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create model directory {}", dir.display()))?;
        let saved = SavedModel {
            input_shape: self.input_shape,
            dropout_rate: self.dropout_rate,
            l2_factor: self.l2_factor,
            data_aug_layer: self.data_aug_layer.clone(),
            head: self.head.clone(),
        };
        let model_path = dir.join(SAVED_MODEL_FILE);
        fs::write(&model_path, serde_json::to_vec_pretty(&saved)?)
            .with_context(|| format!("failed to write {}", model_path.display()))?;

        let target = dir.join(SAVED_BACKBONE_FILE);
        match &self.backbone_path {
            Some(src) if src.is_file() && *src != target => {
                fs::copy(src, &target).with_context(|| {
                    format!("failed to copy backbone {} -> {}", src.display(), target.display())
                })?;
            }
            Some(src) if *src == target => {}
            _ => log::warn!(
                "backbone file not available; {} must be provided separately",
                target.display()
            ),
        }
        Ok(())
    }
}

#[cfg(feature = "backend-tract")]
/// Backbone loader for [`Classifier::create`] backed by tract.
pub fn tract_backbone_loader(path: &Path, shape: InputShape) -> Result<Box<dyn Backbone>> {
    Ok(Box::new(TractBackbone::load(path, shape)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    fn mean_pool(_: &Path, _: InputShape) -> Result<Box<dyn Backbone>> {
        Ok(Box::new(MeanPoolBackbone))
    }

    const EXPERIMENT: &str = r#"
        weights = "imagenet"
        backbone = "models/resnet50.onnx"
        input_shape = [64, 64, 3]
        dropout_rate = 0.2
        classes = 4
        l2_factor = 0.05
        seed = 11

        [data_aug_layer.random_flip]
        mode = "horizontal"

        [data_aug_layer.random_zoom]
        height_factor = 0.1
    "#;

    #[test]
    fn parses_experiment_config() {
        let cfg = ModelConfig::from_toml_str(EXPERIMENT).unwrap();
        assert_eq!(
            cfg.weight_source().unwrap(),
            WeightSource::Pretrained {
                backbone: PathBuf::from("models/resnet50.onnx")
            }
        );
        assert_eq!(cfg.input_shape, InputShape::from([64, 64, 3]));
        assert_eq!(cfg.classes, Some(4));
        assert!(cfg.data_aug_layer.unwrap().random_rotation.is_none());
    }

    #[test]
    fn defaults_match_resnet50() {
        let cfg = ModelConfig::from_toml_str("backbone = \"b.onnx\"\nclasses = 196\n").unwrap();
        assert_eq!(cfg.input_shape, InputShape::default());
        assert_eq!(cfg.dropout_rate, 0.0);
        assert_eq!(cfg.l2_factor, 0.01);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        for raw in [
            "classes = 3\n",
            "backbone = \"b.onnx\"\n",
            "backbone = \"b.onnx\"\nclasses = 0\n",
            "backbone = \"b.onnx\"\nclasses = 3\ninput_shape = [16, 16, 3]\n",
            "backbone = \"b.onnx\"\nclasses = 3\ninput_shape = [64, 64, 1]\n",
            "backbone = \"b.onnx\"\nclasses = 3\ndropout_rate = 1.0\n",
            "backbone = \"b.onnx\"\nclasses = 3\noptimizer = \"adam\"\n",
        ] {
            assert!(ModelConfig::from_toml_str(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn fine_tuned_weights_do_not_need_classes() {
        let cfg = ModelConfig::from_toml_str("weights = \"experiments/exp_003/model\"\n").unwrap();
        assert_eq!(
            cfg.weight_source().unwrap(),
            WeightSource::FineTuned {
                dir: PathBuf::from("experiments/exp_003/model")
            }
        );
    }

    #[test]
    fn predict_returns_distribution_over_classes() {
        let cfg = ModelConfig::from_toml_str(EXPERIMENT).unwrap();
        let mut model = Classifier::create(&cfg, mean_pool).unwrap();
        assert_eq!(model.classes(), 4);
        assert_eq!(model.augmentation().len(), 2);

        let img = RgbImage::from_pixel(100, 80, Rgb([120, 60, 30]));
        let probs = model.predict(&img).unwrap();
        assert_eq!(probs.len(), 4);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(model.predict(&img).unwrap(), probs);

        let (idx, p) = model.top1(&img).unwrap();
        assert!(idx < 4);
        assert_eq!(p, probs.iter().copied().fold(f32::MIN, f32::max));
        assert!(model.regularization_loss() > 0.0);
    }

    #[test]
    fn training_forward_pass_is_a_distribution() {
        let cfg = ModelConfig::from_toml_str(EXPERIMENT).unwrap();
        let mut model = Classifier::create(&cfg, mean_pool).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let img = RgbImage::from_pixel(64, 64, Rgb([200, 10, 90]));
        let probs = model.forward_training(&img, &mut rng).unwrap();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn save_and_restore_fine_tuned_model() {
        let tmp = TempDir::new().unwrap();
        let backbone_file = tmp.path().join("resnet50.onnx");
        fs::write(&backbone_file, b"onnx").unwrap();
        let cfg = ModelConfig::from_toml_str(&format!(
            "backbone = {:?}\nclasses = 3\ninput_shape = [32, 48, 3]\nseed = 1\n",
            backbone_file.display().to_string()
        ))
        .unwrap();
        let mut model = Classifier::create(&cfg, mean_pool).unwrap();

        let dir = tmp.path().join("fine_tuned");
        model.save(&dir).unwrap();
        assert_eq!(fs::read(dir.join(SAVED_BACKBONE_FILE)).unwrap(), b"onnx");

        let restored_cfg =
            ModelConfig::from_toml_str(&format!("weights = {:?}\n", dir.display().to_string()))
                .unwrap();
        let mut loaded_from = None;
        let mut restored = Classifier::create(&restored_cfg, |path, shape| {
            loaded_from = Some((path.to_path_buf(), shape));
            mean_pool(path, shape)
        })
        .unwrap();

        assert_eq!(
            loaded_from,
            Some((dir.join(SAVED_BACKBONE_FILE), InputShape::from([32, 48, 3])))
        );
        assert_eq!(restored.head(), model.head());
        let img = RgbImage::from_pixel(40, 40, Rgb([1, 2, 3]));
        assert_eq!(restored.predict(&img).unwrap(), model.predict(&img).unwrap());
    }

    #[test]
    fn mismatched_backbone_is_rejected_on_restore() {
        let tmp = TempDir::new().unwrap();
        let head = ClassifierHead::from_parts(vec![vec![0.0; 5]; 2], vec![0.0; 2]).unwrap();
        let saved = SavedModel {
            input_shape: InputShape::default(),
            dropout_rate: 0.0,
            l2_factor: 0.01,
            data_aug_layer: None,
            head,
        };
        fs::write(
            tmp.path().join(SAVED_MODEL_FILE),
            serde_json::to_vec(&saved).unwrap(),
        )
        .unwrap();
        let err = Classifier::load(tmp.path(), mean_pool).err().unwrap();
        assert!(err.to_string().contains("5"), "{err}");
    }
}
