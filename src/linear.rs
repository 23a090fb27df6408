//! Dense layer and the batched matmul it rides on.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Array3};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

/// Multiplies `[batch, seq, in]` by `[in, out]`, batch by batch.
pub fn matmul_3d_2d(input: &Array3<f32>, weight: &Array2<f32>) -> Array3<f32> {
    let (batch, seq, _) = input.dim();
    let out_features = weight.shape()[1];
    let mut out = Array3::zeros((batch, seq, out_features));
    for (mut out_b, in_b) in out.outer_iter_mut().zip(input.outer_iter()) {
        out_b.assign(&in_b.dot(weight));
    }
    out
}

/// A fully connected layer.
pub struct Linear {
    // Stored as [in_features, out_features] for efficient matmul.
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Uniformly initialized layer, bound `1/sqrt(in_features)`.
    pub fn new(in_features: usize, out_features: usize) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        Self {
            weight: Array2::random((in_features, out_features), Uniform::new(-bound, bound)),
            bias: Array1::zeros(out_features),
        }
    }

    pub fn from_parts(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weight.shape()[1] != bias.len() {
            bail!(
                "bias length {} does not match weight out features {}",
                bias.len(),
                weight.shape()[1]
            );
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn forward_3d(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if input.shape()[2] != self.in_features() {
            bail!(
                "linear layer expected {} input features, got {}",
                self.in_features(),
                input.shape()[2]
            );
        }
        Ok(matmul_3d_2d(input, &self.weight) + &self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn matmul_3d_2d_per_batch() {
        let input =
            Array3::from_shape_vec((2, 1, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let weight = array![[1.0, 0.0], [0.0, 2.0]];
        let out = matmul_3d_2d(&input, &weight);
        assert_abs_diff_eq!(out[[0, 0, 0]], 1.0);
        assert_abs_diff_eq!(out[[0, 0, 1]], 4.0);
        assert_abs_diff_eq!(out[[1, 0, 0]], 3.0);
        assert_abs_diff_eq!(out[[1, 0, 1]], 8.0);
    }

    #[test]
    fn forward_adds_bias_and_checks_shape() {
        let layer = Linear::from_parts(array![[1.0], [1.0]], array![0.5]).unwrap();
        let input = Array3::from_shape_vec((1, 1, 2), vec![1.0, 2.0]).unwrap();
        let out = layer.forward_3d(&input).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0]], 3.5);

        let bad = Array3::<f32>::zeros((1, 1, 3));
        assert!(layer.forward_3d(&bad).is_err());
    }

    #[test]
    fn mismatched_bias_is_rejected() {
        assert!(Linear::from_parts(array![[1.0, 2.0]], array![0.0]).is_err());
    }
}
