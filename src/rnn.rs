//! Single-direction stacked GRU with packed-length semantics.

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayView2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::activations::{sigmoid_scalar, tanh_scalar};

/// One GRU layer. Gate order in the fused weights is (reset, update, new),
/// each `hidden_size` wide.
pub struct GruCell {
    pub w_ih: Array2<f32>, // [input_size, 3 * hidden]
    pub w_hh: Array2<f32>, // [hidden, 3 * hidden]
    pub b_ih: Array1<f32>,
    pub b_hh: Array1<f32>,
    pub hidden_size: usize,
}

impl GruCell {
    pub fn new(input_size: usize, hidden_size: usize) -> Self {
        let bound = 1.0 / (hidden_size as f32).sqrt();
        let dist = Uniform::new(-bound, bound);
        Self {
            w_ih: Array2::random((input_size, 3 * hidden_size), dist),
            w_hh: Array2::random((hidden_size, 3 * hidden_size), dist),
            b_ih: Array1::random(3 * hidden_size, dist),
            b_hh: Array1::random(3 * hidden_size, dist),
            hidden_size,
        }
    }

    /// Advances one step: `x` is `[batch, input]`, `h` is `[batch, hidden]`.
    pub fn forward(&self, x: &ArrayView2<f32>, h: &ArrayView2<f32>) -> Array2<f32> {
        let hs = self.hidden_size;
        let gi = x.dot(&self.w_ih) + &self.b_ih; // [batch, 3h]
        let gh = h.dot(&self.w_hh) + &self.b_hh;

        let gi_r = gi.slice(s![.., 0..hs]);
        let gi_z = gi.slice(s![.., hs..2 * hs]);
        let gi_n = gi.slice(s![.., 2 * hs..3 * hs]);
        let gh_r = gh.slice(s![.., 0..hs]);
        let gh_z = gh.slice(s![.., hs..2 * hs]);
        let gh_n = gh.slice(s![.., 2 * hs..3 * hs]);

        let reset = (&gi_r + &gh_r).mapv(sigmoid_scalar);
        let update = (&gi_z + &gh_z).mapv(sigmoid_scalar);
        let new = (&gi_n + &(&reset * &gh_n)).mapv(tanh_scalar);

        (1.0 - &update) * &new + &update * h
    }
}

/// Stacked unidirectional GRU. Hidden state shape is `[layers, batch, hidden]`.
pub struct Gru {
    pub layers: Vec<GruCell>,
    pub hidden_size: usize,
}

impl Gru {
    pub fn new(input_size: usize, hidden_size: usize, num_layers: usize) -> Self {
        let layers = (0..num_layers)
            .map(|l| {
                let in_size = if l == 0 { input_size } else { hidden_size };
                GruCell::new(in_size, hidden_size)
            })
            .collect();
        Self {
            layers,
            hidden_size,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Runs the full input sequence, returning per-step top-layer outputs
    /// `[batch, seq, hidden]` and the final hidden state.
    ///
    /// With `lens`, steps at or past a sequence's valid length neither
    /// advance that sequence's hidden state nor contribute output (the
    /// output row is zero), matching packed-sequence behavior.
    pub fn forward(
        &self,
        inputs: &Array3<f32>,
        lens: Option<&[usize]>,
        h0: &Array3<f32>,
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        let (batch, seq, _) = inputs.dim();
        if h0.dim() != (self.num_layers(), batch, self.hidden_size) {
            bail!(
                "initial hidden state has shape {:?}, expected {:?}",
                h0.dim(),
                (self.num_layers(), batch, self.hidden_size)
            );
        }
        if let Some(lens) = lens {
            if lens.len() != batch {
                bail!(
                    "got {} sequence lengths for a batch of {}",
                    lens.len(),
                    batch
                );
            }
        }

        let mut hidden = h0.to_owned();
        let mut outputs = Array3::<f32>::zeros((batch, seq, self.hidden_size));

        for t in 0..seq {
            let mut layer_input = inputs.slice(s![.., t, ..]).to_owned();
            for (l, cell) in self.layers.iter().enumerate() {
                let h_prev = hidden.slice(s![l, .., ..]).to_owned();
                let mut h_next = cell.forward(&layer_input.view(), &h_prev.view());
                if let Some(lens) = lens {
                    for b in 0..batch {
                        if t >= lens[b] {
                            h_next.row_mut(b).assign(&h_prev.row(b));
                        }
                    }
                }
                hidden.slice_mut(s![l, .., ..]).assign(&h_next);
                layer_input = h_next;
            }
            outputs.slice_mut(s![.., t, ..]).assign(&layer_input);
            if let Some(lens) = lens {
                for b in 0..batch {
                    if t >= lens[b] {
                        outputs.slice_mut(s![b, t, ..]).fill(0.0);
                    }
                }
            }
        }

        Ok((outputs, hidden))
    }
}
