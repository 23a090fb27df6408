//! Beam-search generation.

mod beam;

use serde::{Deserialize, Serialize};

pub use beam::{beam_search, top_k_log_probs, CandidateSeq, StepOutput};

/// Parameters for beam-search generation. A `beam_width` of 1 degenerates
/// to greedy decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub beam_width: usize,
    /// Hard upper bound on generated length; the only loop backstop.
    pub max_len: usize,
    pub eos_token_id: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            beam_width: 4,
            max_len: 20,
            eos_token_id: 0,
        }
    }
}
