//! Model configuration surface.

use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Requested execution target. Compute is CPU-side; a `Gpu` request is
/// accepted for config compatibility and falls back to CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

/// Attention scoring method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMethod {
    /// Plain dot product between query and key.
    Dot,
    /// Query is first mapped through a learned square matrix.
    Bilinear,
}

impl FromStr for ScoreMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dot" => Ok(ScoreMethod::Dot),
            "bilinear" | "general" => Ok(ScoreMethod::Bilinear),
            _ => Err(format!("unknown attention score method: {}", s)),
        }
    }
}

/// Static architecture configuration for [`crate::model::KnowledgeSeq2Seq`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub word_vocab_size: usize,
    pub word_embed_size: usize,
    /// Decoder hidden size. Must match the context encoder's hidden size
    /// and be divisible by 4 (the knowledge encoder concatenates four
    /// sub-embeddings of `rnn_hidden_size / 4` each).
    pub rnn_hidden_size: usize,
    pub n_layers: usize,
    pub attn_score_method: ScoreMethod,
    pub dropout: f32,
    /// Enables the second attention head over the encoder token vectors.
    pub use_word_attn: bool,
    /// Vocabulary of dataset-specific triple ids.
    pub triple_vocab_size: usize,
    /// Vocabulary shared by head and tail events.
    pub event_vocab_size: usize,
    pub relation_vocab_size: usize,
    pub device: Device,
    pub pad_token_id: u32,
}

impl ModelConfig {
    /// Verifies that the configuration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.rnn_hidden_size == 0 || self.rnn_hidden_size % 4 != 0 {
            bail!(
                "rnn_hidden_size must be a positive multiple of 4, got {}",
                self.rnn_hidden_size
            );
        }
        if self.n_layers == 0 {
            bail!("at least one decoder layer is required");
        }
        if self.word_vocab_size == 0 || self.word_embed_size == 0 {
            bail!("word vocabulary and embedding sizes must be positive");
        }
        if self.triple_vocab_size == 0
            || self.event_vocab_size == 0
            || self.relation_vocab_size == 0
        {
            bail!("knowledge vocabulary sizes must be positive");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        if (self.pad_token_id as usize) >= self.word_vocab_size {
            bail!(
                "pad token id {} is outside the word vocabulary of size {}",
                self.pad_token_id,
                self.word_vocab_size
            );
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            word_vocab_size: 30_000,
            word_embed_size: 300,
            rnn_hidden_size: 768,
            n_layers: 1,
            attn_score_method: ScoreMethod::Dot,
            dropout: 0.1,
            use_word_attn: true,
            triple_vocab_size: 50_000,
            event_vocab_size: 20_000,
            relation_vocab_size: 20,
            device: Device::Cpu,
            pad_token_id: 0,
        }
    }
}
