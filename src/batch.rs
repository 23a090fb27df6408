//! Inbound batch contract and the outbound training result record.

use ndarray::{Array2, Array3};

/// One padded batch as produced by the (out-of-scope) data layer.
///
/// All id arrays are `[batch, seq]`-shaped and right-padded; the `*_lens`
/// vectors give each row's valid length.
pub struct Batch {
    /// Word-level input token ids and lengths.
    pub encoder_inputs: Array2<u32>,
    pub encoder_lens: Vec<usize>,

    /// Teacher-forcing decoder inputs (start token + shifted response).
    pub decoder_inputs: Array2<u32>,
    pub decoder_lens: Vec<usize>,
    /// Gold next tokens aligned with `decoder_inputs`.
    pub decoder_targets: Array2<u32>,

    /// Dataset-specific triple ids, `[batch, n_triples]`.
    pub triple_ids: Array2<u32>,
    /// Triple contents `[batch, n_triples, 3]`: head event, relation, tail event.
    pub triples: Array3<u32>,
    pub triple_lens: Vec<usize>,

    /// Pretrained-encoder token ids and mask for the input side.
    pub context_token_ids: Array2<u32>,
    pub context_attention_mask: Array2<f32>,
    /// Same for the response side; reserved, not consumed by the forward pass.
    pub response_token_ids: Option<Array2<u32>>,
    pub response_attention_mask: Option<Array2<f32>>,

    /// Decoder start tokens, `[batch, 1]`.
    pub decoder_start: Array2<u32>,
}

/// Scalar summary of one teacher-forced batch, handed to the training loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchResult {
    pub loss: f32,
    /// Correctly predicted tokens among the valid (non-padded) positions.
    pub num_correct: usize,
    /// Valid (non-padded) positions considered.
    pub num_words: usize,
}
