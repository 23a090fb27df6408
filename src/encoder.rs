//! Contract for the frozen pretrained context encoder.

use anyhow::Result;
use ndarray::{Array2, Array3};

/// Output of one encoder invocation.
pub struct EncoderOutput {
    /// Per-token vectors, `[batch, seq, hidden]`.
    pub hidden_states: Array3<f32>,
    /// One summary vector per sequence, `[batch, hidden]`.
    pub pooled: Array2<f32>,
}

/// A frozen contextual encoder. Implementations own read-only parameters;
/// the model never writes into them and gradients never flow here. Injected
/// at construction so tests can substitute a deterministic stand-in.
pub trait ContextEncoder: Send + Sync {
    /// Width of the vectors this encoder produces.
    fn hidden_size(&self) -> usize;

    /// Maps token ids plus an attention mask (`1.0` = real token, `0.0` =
    /// padding) to per-token vectors and a pooled vector.
    fn encode(
        &self,
        token_ids: &Array2<u32>,
        attention_mask: &Array2<f32>,
    ) -> Result<EncoderOutput>;
}
