use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Trainable top of the classifier: dense layer with softmax activation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifierHead {
    /// Row-major `[classes][embedding_len]`.
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

impl ClassifierHead {
    /// Glorot-uniform kernel, zero bias (Keras `Dense` defaults).
    pub fn glorot_uniform<R: Rng>(embedding_len: usize, classes: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (embedding_len + classes) as f32).sqrt();
        let weights = (0..classes)
            .map(|_| {
                (0..embedding_len)
                    .map(|_| rng.gen_range(-limit..=limit))
                    .collect()
            })
            .collect();
        Self {
            weights,
            bias: vec![0.0; classes],
        }
    }

    pub fn from_parts(weights: Vec<Vec<f32>>, bias: Vec<f32>) -> Result<Self> {
        if weights.is_empty() || weights.len() != bias.len() {
            return Err(anyhow!(
                "head needs one bias per class ({} weight rows, {} biases)",
                weights.len(),
                bias.len()
            ));
        }
        let width = weights[0].len();
        if width == 0 || weights.iter().any(|row| row.len() != width) {
            return Err(anyhow!("head weight rows must share a non-zero length"));
        }
        Ok(Self { weights, bias })
    }

    /// Re-check shape invariants, e.g. after deserializing.
    pub fn validated(self) -> Result<Self> {
        Self::from_parts(self.weights, self.bias)
    }

    pub fn classes(&self) -> usize {
        self.bias.len()
    }

    pub fn embedding_len(&self) -> usize {
        self.weights.first().map(Vec::len).unwrap_or(0)
    }

    pub fn logits(&self, embedding: &[f32]) -> Result<Vec<f32>> {
        if embedding.len() != self.embedding_len() {
            return Err(anyhow!(
                "embedding has {} features, head expects {}",
                embedding.len(),
                self.embedding_len()
            ));
        }
        Ok(self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(embedding).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect())
    }

    /// Class probabilities for one embedding.
    pub fn forward(&self, embedding: &[f32]) -> Result<Vec<f32>> {
        Ok(softmax(&self.logits(embedding)?))
    }

    /// L2 kernel regularization term, `factor * sum(w^2)`.
    pub fn l2_penalty(&self, factor: f32) -> f32 {
        factor
            * self
                .weights
                .iter()
                .flatten()
                .map(|w| w * w)
                .sum::<f32>()
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Inverted dropout: zero each feature with probability `rate`, rescale the rest.
pub fn dropout<R: Rng>(features: &mut [f32], rate: f32, rng: &mut R) {
    if rate <= 0.0 {
        return;
    }
    let keep = 1.0 - rate;
    for f in features.iter_mut() {
        if rng.gen::<f32>() < rate {
            *f = 0.0;
        } else {
            *f /= keep;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn softmax_is_a_distribution() {
        let p = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(p[3] > 0.99);
    }

    #[test]
    fn glorot_init_respects_limit_and_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let head = ClassifierHead::glorot_uniform(10, 6, &mut rng);
        assert_eq!(head.classes(), 6);
        assert_eq!(head.embedding_len(), 10);
        let limit = (6.0f32 / 16.0).sqrt();
        assert!(head.weights.iter().flatten().all(|w| w.abs() <= limit));
    }

    #[test]
    fn forward_uses_weights_and_bias() {
        let head = ClassifierHead::from_parts(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![0.0, 0.0])
            .unwrap();
        assert_eq!(head.logits(&[2.0, 3.0]).unwrap(), vec![2.0, 3.0]);
        let p = head.forward(&[0.0, 5.0]).unwrap();
        assert!(p[1] > p[0]);
        assert!(head.forward(&[1.0]).is_err());
        assert_eq!(head.l2_penalty(0.5), 1.0);
    }

    #[test]
    fn mismatched_parts_are_rejected() {
        assert!(ClassifierHead::from_parts(vec![vec![1.0]], vec![]).is_err());
        assert!(ClassifierHead::from_parts(vec![vec![1.0], vec![1.0, 2.0]], vec![0.0, 0.0]).is_err());
    }

    #[test]
    fn zero_dropout_is_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut f = vec![1.0, 2.0, 3.0];
        dropout(&mut f, 0.0, &mut rng);
        assert_eq!(f, vec![1.0, 2.0, 3.0]);
        dropout(&mut f, 0.5, &mut rng);
        assert!(f.iter().all(|v| [0.0, 2.0, 4.0, 6.0].contains(v)));
    }
}
