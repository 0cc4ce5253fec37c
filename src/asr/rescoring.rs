//! Attention rescoring arithmetic.
//!
//! These functions are pure: given decoder log-probabilities and a hypothesis
//! they produce a score, and given CTC and attention scores they produce the
//! final ranking. The same scorer is used for the left-to-right decoder and,
//! after reversing the hypothesis, for the right-to-left decoder.

use std::cmp::Ordering;

use crate::asr::types::{Hypothesis, RescoredHypothesis};
use crate::model::{Matrix, TokenId};

/// Read access to a `position x token` log-probability table.
pub trait ScoreLookup {
    fn log_prob(&self, position: usize, token: TokenId) -> f32;
}

impl ScoreLookup for Matrix {
    fn log_prob(&self, position: usize, token: TokenId) -> f32 {
        self.get(position, token as usize)
    }
}

/// Sum of `probs[j][hyp[j]]` over the hypothesis plus `probs[len][eos]`.
///
/// Exactly `hyp.len() + 1` lookups are made. Rows past `hyp.len()` are never read,
/// so padding rows of a batched decoder output cannot leak into the score.
pub fn compute_attention_score<S>(probs: &S, hyp: &[TokenId], eos: TokenId) -> f32
where
    S: ScoreLookup + ?Sized,
{
    let score: f32 = hyp
        .iter()
        .enumerate()
        .map(|(j, &token)| probs.log_prob(j, token))
        .sum();
    score + probs.log_prob(hyp.len(), eos)
}

/// Bidirectional fusion: `forward * (1 - w) + backward * w`.
pub fn fuse_scores(forward: f32, backward: f32, reverse_weight: f32) -> f32 {
    forward * (1.0 - reverse_weight) + backward * reverse_weight
}

/// Rank CTC hypotheses (given in CTC rank order) by their final score.
///
/// With attention scores the final score is
/// `rescoring_weight * attention + ctc_weight * ctc`; without them the CTC score
/// is kept as-is. The sort is stable, so ties keep their CTC rank.
pub fn rank_hypotheses(
    hypotheses: Vec<Hypothesis>,
    attention: Option<&[f32]>,
    ctc_weight: f32,
    rescoring_weight: f32,
) -> Vec<RescoredHypothesis> {
    let mut ranked: Vec<RescoredHypothesis> = hypotheses
        .into_iter()
        .enumerate()
        .map(|(ctc_rank, hypothesis)| {
            let attention_score = attention.and_then(|scores| scores.get(ctc_rank).copied());
            let final_score = match attention_score {
                Some(att) => rescoring_weight * att + ctc_weight * hypothesis.score,
                None => hypothesis.score,
            };
            RescoredHypothesis {
                hypothesis,
                ctc_rank,
                attention_score,
                final_score,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(Ordering::Equal)
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingLookup {
        table: Matrix,
        lookups: Cell<usize>,
    }

    impl ScoreLookup for CountingLookup {
        fn log_prob(&self, position: usize, token: TokenId) -> f32 {
            self.lookups.set(self.lookups.get() + 1);
            self.table.log_prob(position, token)
        }
    }

    fn table() -> Matrix {
        Matrix::from_rows(vec![
            vec![-0.1, -0.2, -0.3, -0.4],
            vec![-1.0, -2.0, -3.0, -4.0],
            vec![-10.0, -20.0, -30.0, -40.0],
            vec![-100.0, -200.0, -300.0, -400.0],
        ])
        .unwrap()
    }

    #[test]
    fn test_attention_score_sums_tokens_and_end_marker() {
        let probs = CountingLookup {
            table: table(),
            lookups: Cell::new(0),
        };
        // hyp [a, b] = [1, 2], eos = 3: P[0][1] + P[1][2] + P[2][3]
        let score = compute_attention_score(&probs, &[1, 2], 3);
        assert!((score - (-0.2 - 3.0 - 40.0)).abs() < 1e-5);
        assert_eq!(probs.lookups.get(), 3);
    }

    #[test]
    fn test_empty_hypothesis_reads_only_end_marker() {
        let probs = CountingLookup {
            table: table(),
            lookups: Cell::new(0),
        };
        let score = compute_attention_score(&probs, &[], 3);
        assert!((score - (-0.4)).abs() < 1e-6);
        assert_eq!(probs.lookups.get(), 1);
    }

    #[test]
    fn test_padding_rows_do_not_affect_score() {
        let short = table().slice_rows(0, 3);
        let full = table();
        assert_eq!(
            compute_attention_score(&short, &[0, 1], 3),
            compute_attention_score(&full, &[0, 1], 3)
        );
    }

    #[test]
    fn test_fuse_scores() {
        assert_eq!(fuse_scores(-4.0, -8.0, 0.0), -4.0);
        assert_eq!(fuse_scores(-4.0, -8.0, 0.5), -6.0);
        assert_eq!(fuse_scores(-4.0, 0.0, 0.25), -3.0);
    }

    fn hyp(tokens: &[TokenId], score: f32) -> Hypothesis {
        Hypothesis {
            tokens: tokens.to_vec(),
            score,
            times: Vec::new(),
        }
    }

    #[test]
    fn test_rank_without_attention_keeps_ctc_order() {
        let ranked = rank_hypotheses(vec![hyp(&[1], -1.0), hyp(&[2], -2.0)], None, 0.5, 1.0);
        assert_eq!(ranked[0].hypothesis.tokens, vec![1]);
        assert_eq!(ranked[0].final_score, -1.0);
        assert_eq!(ranked[1].ctc_rank, 1);
        assert!(ranked[1].attention_score.is_none());
    }

    #[test]
    fn test_rank_with_attention_reorders_and_breaks_ties_by_ctc_rank() {
        let hyps = vec![hyp(&[1], -1.0), hyp(&[2], -2.0), hyp(&[3], -3.0)];
        // finals: -1*0.5 + -6 = -6.5, -2*0.5 + -1 = -2.0, -3*0.5 - 0.5 = -2.0
        let ranked = rank_hypotheses(hyps, Some(&[-6.0, -1.0, -0.5]), 0.5, 1.0);
        let order: Vec<usize> = ranked.iter().map(|r| r.ctc_rank).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert_eq!(ranked[0].final_score, -2.0);
    }
}
