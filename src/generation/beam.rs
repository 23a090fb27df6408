//! Beam-search state machine: candidate sequences, staged expansion,
//! terminal set, early termination.

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array3};

use super::GenerationConfig;

/// What one decode step produces for a single candidate.
pub struct StepOutput {
    /// Log-probabilities over the vocabulary for the next token.
    pub log_probs: Array1<f32>,
    /// Fresh hidden-state snapshot, `[layers, 1, hidden]`. The previous
    /// snapshot is never mutated; this one replaces it in the candidate.
    pub hidden: Array3<f32>,
}

/// One hypothesis under construction.
#[derive(Clone)]
pub struct CandidateSeq {
    /// Full token history including the start token.
    pub tokens: Vec<u32>,
    /// Cumulative log-probability of everything after the start token.
    pub score: f32,
    pub last_token: u32,
    pub hidden: Array3<f32>,
}

impl CandidateSeq {
    fn extend(&self, token: u32, log_prob: f32, hidden: &Array3<f32>) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(token);
        Self {
            tokens,
            score: self.score + log_prob,
            last_token: token,
            hidden: hidden.clone(),
        }
    }
}

struct Beam {
    width: usize,
    current: Vec<CandidateSeq>,
    staged: Vec<CandidateSeq>,
    terminal: Vec<CandidateSeq>,
}

impl Beam {
    fn new(width: usize, start_token: u32, hidden: Array3<f32>) -> Self {
        Self {
            width,
            current: vec![CandidateSeq {
                tokens: vec![start_token],
                score: 0.0,
                last_token: start_token,
                hidden,
            }],
            staged: Vec::new(),
            terminal: Vec::new(),
        }
    }

    fn stage(&mut self, parent_idx: usize, token: u32, log_prob: f32, hidden: &Array3<f32>) {
        let candidate = self.current[parent_idx].extend(token, log_prob, hidden);
        self.staged.push(candidate);
    }

    /// Replaces the active beam with the top-K staged candidates. The sort
    /// is stable, so equal scores keep staging order (earlier slot, higher
    /// per-slot rank wins).
    fn commit(&mut self) {
        self.staged
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        self.staged.truncate(self.width);
        self.current = std::mem::take(&mut self.staged);
    }
}

/// First candidate with the maximum score; first-seen wins ties.
fn best(candidates: &[CandidateSeq]) -> Option<&CandidateSeq> {
    candidates.iter().fold(None, |best, c| match best {
        Some(b) if c.score <= b.score => Some(b),
        _ => Some(c),
    })
}

/// Top-`k` token ids by log-probability, highest first. The sort is stable,
/// so equal log-probabilities resolve to the lower token id.
pub fn top_k_log_probs(log_probs: &Array1<f32>, k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = log_probs
        .iter()
        .enumerate()
        .map(|(i, &lp)| (i as u32, lp))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    indexed.truncate(k);
    indexed
}

/// Runs beam search with `step` decoding one pending token for one
/// candidate. Returns the best completed candidate, or the best partial
/// candidate when the length bound is hit first (degraded result, not an
/// error).
///
/// The slot loop order is part of the output contract: once the terminal
/// set reaches the beam width mid-step, the remaining slots of that step
/// are not expanded.
pub fn beam_search<F>(
    start_token: u32,
    init_hidden: Array3<f32>,
    config: &GenerationConfig,
    mut step: F,
) -> Result<CandidateSeq>
where
    F: FnMut(u32, &Array3<f32>) -> Result<StepOutput>,
{
    let width = config.beam_width;
    let mut beam = Beam::new(width, start_token, init_hidden);
    let mut done = false;

    'search: for _ in 0..config.max_len {
        beam.staged.clear();
        for slot in 0..beam.current.len() {
            if beam.current[slot].last_token == config.eos_token_id {
                let finished = beam.current[slot].clone();
                beam.terminal.push(finished);
                if beam.terminal.len() >= width {
                    done = true;
                    break 'search;
                }
                continue;
            }
            let out = step(beam.current[slot].last_token, &beam.current[slot].hidden)?;
            for (token, log_prob) in top_k_log_probs(&out.log_probs, width * 2) {
                beam.stage(slot, token, log_prob, &out.hidden);
            }
        }
        if beam.staged.is_empty() {
            // Every live slot was terminal; nothing left to expand.
            break;
        }
        beam.commit();
    }

    let winner = if done {
        best(&beam.terminal)
    } else {
        if !beam.terminal.is_empty() {
            log::debug!(
                "beam search hit the length bound with {} of {} finished candidates",
                beam.terminal.len(),
                width
            );
        }
        best(&beam.current)
    };

    winner
        .cloned()
        .ok_or_else(|| anyhow!("beam search produced no candidates"))
}
