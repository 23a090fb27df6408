//! Knowledge-grounded dialogue response generation.
//!
//! A sequence-to-sequence model that conditions a GRU decoder on a frozen
//! pretrained context encoder and on commonsense-knowledge triples
//! (head event, relation, tail event). Each decode step fuses the decoder
//! state with attention contexts over the triple embeddings and, optionally,
//! over the encoder token vectors. Training is teacher-forced; inference is
//! beam search with early termination.

pub mod activations;
pub mod attention;
pub mod batch;
pub mod config;
pub mod embedding;
pub mod encoder;
pub mod generation;
pub mod linear;
pub mod model;
pub mod rnn;

pub use batch::{Batch, BatchResult};
pub use config::{Device, ModelConfig, ScoreMethod};
pub use encoder::{ContextEncoder, EncoderOutput};
pub use generation::{beam_search, CandidateSeq, GenerationConfig, StepOutput};
pub use model::KnowledgeSeq2Seq;
