//! Length-masked attention over knowledge triples or encoder token vectors.

use anyhow::{bail, Result};
use ndarray::{s, Array2, Array3};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::activations::softmax_1d_inplace;
use crate::config::ScoreMethod;

/// Attention head with a configurable scoring method. Key positions past a
/// sequence's valid length are forced to `-inf` before normalization, so
/// their weights come out exactly zero.
pub struct Attention {
    method: ScoreMethod,
    /// Learned square map for `ScoreMethod::Bilinear`.
    bilinear: Option<Array2<f32>>,
}

impl Attention {
    pub fn new(hidden_size: usize, method: ScoreMethod) -> Self {
        let bilinear = match method {
            ScoreMethod::Dot => None,
            ScoreMethod::Bilinear => {
                let bound = 1.0 / (hidden_size as f32).sqrt();
                Some(Array2::random(
                    (hidden_size, hidden_size),
                    Uniform::new(-bound, bound),
                ))
            }
        };
        Self { method, bilinear }
    }

    /// `query`: `[batch, q_len, hidden]` (decoder outputs).
    /// `keys`: `[batch, k_len, hidden]`, used as both keys and values.
    /// Returns the weighted context `[batch, q_len, hidden]` and the raw
    /// attention weights `[batch, q_len, k_len]`. Query rows past
    /// `q_lens[b]` are zeroed in both.
    pub fn forward(
        &self,
        query: &Array3<f32>,
        keys: &Array3<f32>,
        q_lens: Option<&[usize]>,
        k_lens: &[usize],
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        let (batch, q_len, hidden) = query.dim();
        let (k_batch, k_len, k_hidden) = keys.dim();
        if k_batch != batch {
            bail!(
                "query batch {} does not match key batch {}",
                batch,
                k_batch
            );
        }
        if k_hidden != hidden {
            bail!(
                "query hidden size {} does not match key hidden size {}",
                hidden,
                k_hidden
            );
        }
        if k_lens.len() != batch {
            bail!(
                "got {} key lengths for a batch of {}",
                k_lens.len(),
                batch
            );
        }
        if let Some(q_lens) = q_lens {
            if q_lens.len() != batch {
                bail!(
                    "got {} query lengths for a batch of {}",
                    q_lens.len(),
                    batch
                );
            }
        }

        let mut contexts = Array3::<f32>::zeros((batch, q_len, hidden));
        let mut weights = Array3::<f32>::zeros((batch, q_len, k_len));

        for b in 0..batch {
            let valid_k = k_lens[b];
            if valid_k == 0 || valid_k > k_len {
                bail!(
                    "key length {} for batch row {} is outside 1..={}",
                    valid_k,
                    b,
                    k_len
                );
            }

            let q_b = query.slice(s![b, .., ..]);
            let k_b = keys.slice(s![b, .., ..]);

            let mut scores = match self.method {
                ScoreMethod::Dot => q_b.dot(&k_b.t()),
                ScoreMethod::Bilinear => {
                    let w = self.bilinear.as_ref().expect("bilinear weight present");
                    q_b.dot(w).dot(&k_b.t())
                }
            };

            for mut row in scores.rows_mut() {
                for j in valid_k..k_len {
                    row[j] = f32::NEG_INFINITY;
                }
                softmax_1d_inplace(&mut row);
            }

            let mut ctx = scores.dot(&k_b);
            if let Some(q_lens) = q_lens {
                for i in q_lens[b]..q_len {
                    ctx.row_mut(i).fill(0.0);
                    scores.row_mut(i).fill(0.0);
                }
            }

            contexts.slice_mut(s![b, .., ..]).assign(&ctx);
            weights.slice_mut(s![b, .., ..]).assign(&scores);
        }

        Ok((contexts, weights))
    }
}
