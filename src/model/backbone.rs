use anyhow::{anyhow, Result};
use ndarray::{Array4, Axis};

/// Pretrained feature extractor at the base of the classifier.
///
/// Input is a single preprocessed image as `[1, height, width, 3]`; output is a
/// pooled embedding of fixed length.
pub trait Backbone {
    fn name(&self) -> &'static str;

    /// Length of the vector returned by [`Backbone::embed`].
    fn embedding_len(&self) -> usize;

    fn embed(&mut self, input: &Array4<f32>) -> Result<Vec<f32>>;
}

impl<B: Backbone + ?Sized> Backbone for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn embedding_len(&self) -> usize {
        (**self).embedding_len()
    }

    fn embed(&mut self, input: &Array4<f32>) -> Result<Vec<f32>> {
        (**self).embed(input)
    }
}

/// Global average pooling over the spatial axes, one value per channel.
///
/// Stands in for a real network when only the wiring is under test.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanPoolBackbone;

impl Backbone for MeanPoolBackbone {
    fn name(&self) -> &'static str {
        "mean-pool"
    }

    fn embedding_len(&self) -> usize {
        3
    }

    fn embed(&mut self, input: &Array4<f32>) -> Result<Vec<f32>> {
        let (batch, height, width, channels) = input.dim();
        if batch != 1 || channels != 3 || height == 0 || width == 0 {
            return Err(anyhow!(
                "expected input of shape [1, h, w, 3], got {:?}",
                input.shape()
            ));
        }
        let pooled = input
            .index_axis(Axis(0), 0)
            .mean_axis(Axis(0))
            .and_then(|rows| rows.mean_axis(Axis(0)))
            .ok_or_else(|| anyhow!("cannot pool an empty input"))?;
        Ok(pooled.to_vec())
    }
}

#[cfg(feature = "backend-tract")]
pub use tract_backbone::TractBackbone;

#[cfg(feature = "backend-tract")]
mod tract_backbone {
    use std::path::Path;

    use anyhow::{anyhow, Context, Result};
    use ndarray::Array4;
    use tract_onnx::prelude::*;

    use super::Backbone;
    use crate::model::InputShape;

    /// ONNX feature extractor (e.g. ResNet-50 without top, average pooled).
    ///
    /// The model must take `[1, H, W, 3]` float input and return `[1, D]`.
    pub struct TractBackbone {
        model: SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>,
        shape: InputShape,
        embedding_len: usize,
    }

    impl TractBackbone {
        pub fn load<P: AsRef<Path>>(model_path: P, shape: InputShape) -> Result<Self> {
            let model_path = model_path.as_ref();
            let model = tract_onnx::onnx()
                .model_for_path(model_path)
                .with_context(|| {
                    format!("failed to load backbone from {}", model_path.display())
                })?
                .with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec!(1, shape.height as usize, shape.width as usize, 3),
                    ),
                )
                .context("failed to set input fact")?
                .into_optimized()
                .context("failed to optimize backbone")?
                .into_runnable()
                .context("failed to build runnable backbone")?;

            let embedding_len = {
                let fact = model
                    .model()
                    .output_fact(0)
                    .context("backbone has no output")?;
                let dims = fact
                    .shape
                    .as_concrete()
                    .ok_or_else(|| anyhow!("backbone output shape is not concrete"))?;
                match dims {
                    [1, d] => *d,
                    other => {
                        return Err(anyhow!(
                            "backbone output shape {:?} is not a pooled [1, D] embedding",
                            other
                        ))
                    }
                }
            };

            log::info!(
                "loaded backbone {} ({} features)",
                model_path.display(),
                embedding_len
            );
            Ok(Self {
                model,
                shape,
                embedding_len,
            })
        }
    }

    impl Backbone for TractBackbone {
        fn name(&self) -> &'static str {
            "tract"
        }

        fn embedding_len(&self) -> usize {
            self.embedding_len
        }

        fn embed(&mut self, input: &Array4<f32>) -> Result<Vec<f32>> {
            let (_, h, w, _) = input.dim();
            if h != self.shape.height as usize || w != self.shape.width as usize {
                return Err(anyhow!(
                    "input {}x{} does not match backbone input {}x{}",
                    w,
                    h,
                    self.shape.width,
                    self.shape.height
                ));
            }
            let data: Vec<f32> = input.iter().copied().collect();
            let tensor = tract_ndarray::Array4::from_shape_vec(input.dim(), data)
                .context("failed to build backbone input")?
                .into_tensor();
            let outputs = self
                .model
                .run(tvec!(tensor.into()))
                .context("backbone inference failed")?;
            let output = outputs
                .first()
                .ok_or_else(|| anyhow!("backbone produced no outputs"))?;
            let view = output
                .to_array_view::<f32>()
                .context("backbone output tensor was not f32")?;
            Ok(view.iter().copied().collect())
        }
    }
}
