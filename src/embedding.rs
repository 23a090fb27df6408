//! Word embedding table and the knowledge-triple encoder.

use anyhow::{bail, Result};
use ndarray::{concatenate, s, Array2, Array3, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rayon::prelude::*;

/// A plain lookup table. Out-of-vocabulary indices are a fatal error.
pub struct Embedding {
    pub weight: Array2<f32>,
}

impl Embedding {
    pub fn new(vocab_size: usize, embed_size: usize) -> Self {
        Self {
            weight: Array2::random((vocab_size, embed_size), Uniform::new(-0.1, 0.1)),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn embed_size(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Looks up `[batch, seq]` ids into `[batch, seq, embed]` vectors.
    pub fn forward(&self, ids: &Array2<u32>) -> Result<Array3<f32>> {
        let vocab_size = self.vocab_size();
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= vocab_size) {
            bail!(
                "embedding index {} is out of range for vocabulary of size {}",
                bad,
                vocab_size
            );
        }

        let (batch, seq) = ids.dim();
        let mut hidden = Array3::<f32>::zeros((batch, seq, self.embed_size()));
        hidden
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(ids.axis_iter(Axis(0)))
            .for_each(|(mut hidden_slice, row)| {
                for (j, &token_id) in row.iter().enumerate() {
                    hidden_slice
                        .slice_mut(s![j, ..])
                        .assign(&self.weight.row(token_id as usize));
                }
            });
        Ok(hidden)
    }
}

/// Embeds each knowledge triple by concatenating four sub-embeddings:
/// triple id, head event, relation, tail event. Head and tail share one
/// event table. Each sub-embedding is a quarter of the output width.
pub struct KnowledgeEncoder {
    triple_id_embedding: Embedding,
    event_embedding: Embedding,
    relation_embedding: Embedding,
}

impl KnowledgeEncoder {
    pub fn new(
        triple_vocab_size: usize,
        event_vocab_size: usize,
        relation_vocab_size: usize,
        output_size: usize,
    ) -> Result<Self> {
        if output_size % 4 != 0 {
            bail!(
                "knowledge embedding size must be divisible by 4, got {}",
                output_size
            );
        }
        let sub_size = output_size / 4;
        Ok(Self {
            triple_id_embedding: Embedding::new(triple_vocab_size, sub_size),
            event_embedding: Embedding::new(event_vocab_size, sub_size),
            relation_embedding: Embedding::new(relation_vocab_size, sub_size),
        })
    }

    /// `triple_ids`: `[batch, n_triples]` dataset-specific ids.
    /// `triples`: `[batch, n_triples, 3]` (head event, relation, tail event).
    /// Returns `[batch, n_triples, output_size]`.
    pub fn encode(&self, triple_ids: &Array2<u32>, triples: &Array3<u32>) -> Result<Array3<f32>> {
        if triples.shape()[2] != 3 {
            bail!(
                "knowledge triples must have 3 components, got {}",
                triples.shape()[2]
            );
        }
        if triples.shape()[0] != triple_ids.shape()[0]
            || triples.shape()[1] != triple_ids.shape()[1]
        {
            bail!(
                "triple id shape {:?} does not match triple content shape {:?}",
                triple_ids.shape(),
                triples.shape()
            );
        }

        let id_embs = self.triple_id_embedding.forward(triple_ids)?;
        let head_embs = self
            .event_embedding
            .forward(&triples.slice(s![.., .., 0]).to_owned())?;
        let rel_embs = self
            .relation_embedding
            .forward(&triples.slice(s![.., .., 1]).to_owned())?;
        let tail_embs = self
            .event_embedding
            .forward(&triples.slice(s![.., .., 2]).to_owned())?;

        let out = concatenate(
            Axis(2),
            &[
                id_embs.view(),
                head_embs.view(),
                rel_embs.view(),
                tail_embs.view(),
            ],
        )?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn lookup_matches_table_rows() {
        let mut emb = Embedding::new(4, 2);
        emb.weight = Array2::from_shape_vec(
            (4, 2),
            vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        )
        .unwrap();
        let ids = Array2::from_shape_vec((1, 3), vec![2u32, 0, 3]).unwrap();
        let out = emb.forward(&ids).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0]], 3.0);
        assert_abs_diff_eq!(out[[0, 0, 1]], 4.0);
        assert_abs_diff_eq!(out[[0, 1, 0]], 0.0);
        assert_abs_diff_eq!(out[[0, 2, 1]], 6.0);
    }

    #[test]
    fn out_of_vocabulary_is_fatal() {
        let emb = Embedding::new(4, 2);
        let ids = Array2::from_shape_vec((1, 1), vec![4u32]).unwrap();
        assert!(emb.forward(&ids).is_err());
    }

    #[test]
    fn triple_embedding_concatenates_four_parts() {
        let enc = KnowledgeEncoder::new(10, 10, 5, 8).unwrap();
        let triple_ids = Array2::from_shape_vec((1, 2), vec![1u32, 2]).unwrap();
        let triples =
            Array3::from_shape_vec((1, 2, 3), vec![3u32, 0, 4, 5, 1, 6]).unwrap();
        let out = enc.encode(&triple_ids, &triples).unwrap();
        assert_eq!(out.dim(), (1, 2, 8));

        // Head and tail share the event table, so a triple with head == tail
        // repeats the same sub-vector in slots 1 and 3.
        let same = Array3::from_shape_vec((1, 1, 3), vec![7u32, 1, 7]).unwrap();
        let same_ids = Array2::from_shape_vec((1, 1), vec![0u32]).unwrap();
        let out = enc.encode(&same_ids, &same).unwrap();
        for j in 0..2 {
            assert_abs_diff_eq!(out[[0, 0, 2 + j]], out[[0, 0, 6 + j]]);
        }
    }

    #[test]
    fn malformed_triples_are_rejected() {
        let enc = KnowledgeEncoder::new(10, 10, 5, 8).unwrap();
        let triple_ids = Array2::from_shape_vec((1, 1), vec![0u32]).unwrap();
        let wide = Array3::<u32>::zeros((1, 1, 4));
        assert!(enc.encode(&triple_ids, &wide).is_err());
        let misaligned = Array3::<u32>::zeros((1, 2, 3));
        assert!(enc.encode(&triple_ids, &misaligned).is_err());
        assert!(KnowledgeEncoder::new(10, 10, 5, 6).is_err());
    }
}
