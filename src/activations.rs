//! Scalar activations and softmax helpers.

use libm::{expf, tanhf};
use ndarray::{Array1, Array3, ArrayView1, ArrayViewMut1, Axis};

#[inline(always)]
pub fn tanh_scalar(x: f32) -> f32 {
    tanhf(x)
}

#[inline(always)]
pub fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + expf(-x))
}

/// In-place softmax over a 1D view. `-inf` entries come out as exactly 0.
pub fn softmax_1d_inplace(row: &mut ArrayViewMut1<f32>) {
    let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0f32;
    row.mapv_inplace(|v| {
        let e = expf(v - max);
        sum += e;
        e
    });
    row.mapv_inplace(|v| v / sum);
}

/// Log-softmax over a 1D view.
pub fn log_softmax_1d(row: &ArrayView1<f32>) -> Array1<f32> {
    let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let sum: f32 = row.iter().map(|&v| expf(v - max)).sum();
    let log_z = max + sum.ln();
    row.mapv(|v| v - log_z)
}

/// Log-softmax over the vocabulary axis of `[batch, seq, vocab]` logits.
pub fn log_softmax_3d(logits: &Array3<f32>) -> Array3<f32> {
    let mut out = logits.clone();
    for mut lane in out.lanes_mut(Axis(2)) {
        let max = lane.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let sum: f32 = lane.iter().map(|&v| expf(v - max)).sum();
        let log_z = max + sum.ln();
        lane.mapv_inplace(|v| v - log_z);
    }
    out
}
