//! Incremental CTC prefix beam search.
//!
//! Each call to [`CtcPrefixBeamSearch::search`] consumes the next block of CTC
//! log-probability frames, so a streaming decoder can feed frames as the
//! encoder produces them and read the running n-best at any point. Per prefix
//! the search tracks blank-ending and non-blank-ending probabilities, a viterbi
//! path used for token emission times, and the context-biasing state.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::asr::context::{ContextGraph, ContextState};
use crate::asr::options::{DecodeOptions, SessionConfig};
use crate::asr::types::{Hypothesis, Vocabulary};
use crate::model::{LogProbMatrix, TokenId};

/// `ln(exp(a) + exp(b))` without overflow.
pub fn log_add(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + (-(a - b).abs()).exp().ln_1p()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CtcSearchOptions {
    pub beam_size: usize,
    /// Tokens kept per frame before prefix expansion.
    pub first_beam_size: usize,
    pub blank_id: TokenId,
}

impl Default for CtcSearchOptions {
    fn default() -> Self {
        Self {
            beam_size: 10,
            first_beam_size: 10,
            blank_id: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct PrefixScore {
    /// Log probability of all paths ending in blank.
    blank: f32,
    /// Log probability of all paths ending in the last token.
    non_blank: f32,
    viterbi_blank: f32,
    viterbi_non_blank: f32,
    /// Best probability seen for the last token on the non-blank viterbi path.
    last_token_prob: f32,
    times_blank: Vec<usize>,
    times_non_blank: Vec<usize>,
    context_state: ContextState,
    context_score: f32,
}

impl PrefixScore {
    fn empty() -> Self {
        Self {
            blank: f32::NEG_INFINITY,
            non_blank: f32::NEG_INFINITY,
            viterbi_blank: f32::NEG_INFINITY,
            viterbi_non_blank: f32::NEG_INFINITY,
            last_token_prob: f32::NEG_INFINITY,
            times_blank: Vec::new(),
            times_non_blank: Vec::new(),
            context_state: ContextGraph::ROOT,
            context_score: 0.0,
        }
    }

    fn root() -> Self {
        Self {
            blank: 0.0,
            viterbi_blank: 0.0,
            ..Self::empty()
        }
    }

    fn score(&self) -> f32 {
        log_add(self.blank, self.non_blank)
    }

    fn viterbi_score(&self) -> f32 {
        self.viterbi_blank.max(self.viterbi_non_blank)
    }

    fn times(&self) -> &[usize] {
        if self.viterbi_blank > self.viterbi_non_blank {
            &self.times_blank
        } else {
            &self.times_non_blank
        }
    }

    fn total_score(&self) -> f32 {
        self.score() + self.context_score
    }
}

type Beam = Vec<(Vec<TokenId>, PrefixScore)>;

fn rank(a: &(Vec<TokenId>, PrefixScore), b: &(Vec<TokenId>, PrefixScore)) -> Ordering {
    b.1.total_score()
        .partial_cmp(&a.1.total_score())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

#[derive(Debug, Clone)]
pub struct CtcPrefixBeamSearch {
    options: CtcSearchOptions,
    context: Option<Arc<ContextGraph>>,
    beam: Beam,
    frames_consumed: usize,
}

impl CtcPrefixBeamSearch {
    pub fn new(options: CtcSearchOptions, context: Option<Arc<ContextGraph>>) -> Self {
        let context = context.filter(|graph| !graph.is_empty());
        Self {
            options,
            context,
            beam: vec![(Vec::new(), PrefixScore::root())],
            frames_consumed: 0,
        }
    }

    /// Search configured from server options, biased by the session's context words.
    pub fn for_session(
        options: &DecodeOptions,
        config: &SessionConfig,
        vocabulary: &Vocabulary,
    ) -> Self {
        let context = (!config.context_words.is_empty()).then(|| {
            Arc::new(ContextGraph::from_words(
                &config.context_words,
                vocabulary,
                config.context_score,
            ))
        });
        Self::new(
            CtcSearchOptions {
                beam_size: options.beam_size,
                first_beam_size: options.first_beam_size,
                blank_id: options.blank_id,
            },
            context,
        )
    }

    /// Encoder frames consumed since the last reset.
    pub fn frames_consumed(&self) -> usize {
        self.frames_consumed
    }

    pub fn reset(&mut self) {
        self.beam = vec![(Vec::new(), PrefixScore::root())];
        self.frames_consumed = 0;
    }

    /// Tokens of the best prefix.
    pub fn best(&self) -> &[TokenId] {
        self.beam.first().map(|(prefix, _)| prefix.as_slice()).unwrap_or(&[])
    }

    /// Current n-best in rank order.
    pub fn hypotheses(&self) -> Vec<Hypothesis> {
        self.beam
            .iter()
            .map(|(prefix, score)| Hypothesis {
                tokens: prefix.clone(),
                score: score.total_score(),
                times: score.times().to_vec(),
            })
            .collect()
    }

    fn top_tokens(&self, row: &[f32]) -> Vec<(TokenId, f32)> {
        let mut tokens: Vec<(TokenId, f32)> = row
            .iter()
            .enumerate()
            .map(|(id, &logp)| (id as TokenId, logp))
            .collect();
        tokens.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        tokens.truncate(self.options.first_beam_size.max(1));
        tokens
    }

    fn extend<'a>(
        &self,
        next: &'a mut HashMap<Vec<TokenId>, PrefixScore>,
        prefix: &[TokenId],
        parent: &PrefixScore,
        token: TokenId,
    ) -> &'a mut PrefixScore {
        let mut extended = prefix.to_vec();
        extended.push(token);
        next.entry(extended).or_insert_with(|| {
            let mut fresh = PrefixScore::empty();
            fresh.context_state = parent.context_state;
            fresh.context_score = parent.context_score;
            if let Some(graph) = &self.context {
                let (state, delta) = graph.advance(parent.context_state, token);
                fresh.context_state = state;
                fresh.context_score += delta;
            }
            fresh
        })
    }

    /// Advance the search over new CTC frames. Returns whether the best prefix changed.
    pub fn search(&mut self, log_probs: &LogProbMatrix) -> bool {
        let before = self.best().to_vec();
        let blank = self.options.blank_id;

        for row in log_probs.iter_rows() {
            let t = self.frames_consumed;
            let mut next: HashMap<Vec<TokenId>, PrefixScore> = HashMap::new();

            for (token, prob) in self.top_tokens(row) {
                for (prefix, score) in &self.beam {
                    if token == blank {
                        let entry = next.entry(prefix.clone()).or_insert_with(|| PrefixScore {
                            context_state: score.context_state,
                            context_score: score.context_score,
                            ..PrefixScore::empty()
                        });
                        entry.blank = log_add(entry.blank, score.score() + prob);
                        let viterbi = score.viterbi_score() + prob;
                        if viterbi > entry.viterbi_blank {
                            entry.viterbi_blank = viterbi;
                            entry.times_blank = score.times().to_vec();
                        }
                    } else if prefix.last() == Some(&token) {
                        // Repeated token without a blank in between: same prefix.
                        let entry = next.entry(prefix.clone()).or_insert_with(|| PrefixScore {
                            context_state: score.context_state,
                            context_score: score.context_score,
                            ..PrefixScore::empty()
                        });
                        entry.non_blank = log_add(entry.non_blank, score.non_blank + prob);
                        let viterbi = score.viterbi_non_blank + prob;
                        if viterbi > entry.viterbi_non_blank {
                            entry.viterbi_non_blank = viterbi;
                            entry.times_non_blank = score.times_non_blank.clone();
                            entry.last_token_prob = score.last_token_prob;
                            if prob > entry.last_token_prob {
                                entry.last_token_prob = prob;
                                if let Some(last) = entry.times_non_blank.last_mut() {
                                    *last = t;
                                }
                            }
                        }

                        // Token separated by a blank: extends the prefix.
                        let entry = self.extend(&mut next, prefix, score, token);
                        entry.non_blank = log_add(entry.non_blank, score.blank + prob);
                        let viterbi = score.viterbi_blank + prob;
                        if viterbi > entry.viterbi_non_blank {
                            entry.viterbi_non_blank = viterbi;
                            entry.last_token_prob = prob;
                            entry.times_non_blank = score.times_blank.clone();
                            entry.times_non_blank.push(t);
                        }
                    } else {
                        let entry = self.extend(&mut next, prefix, score, token);
                        entry.non_blank = log_add(entry.non_blank, score.score() + prob);
                        let viterbi = score.viterbi_score() + prob;
                        if viterbi > entry.viterbi_non_blank {
                            entry.viterbi_non_blank = viterbi;
                            entry.last_token_prob = prob;
                            entry.times_non_blank = score.times().to_vec();
                            entry.times_non_blank.push(t);
                        }
                    }
                }
            }

            let mut beam: Beam = next.into_iter().collect();
            beam.sort_by(rank);
            beam.truncate(self.options.beam_size.max(1));
            self.beam = beam;
            self.frames_consumed += 1;
        }

        self.best() != before.as_slice()
    }

    /// Refund context bonuses of words left unfinished at the end of the utterance.
    pub fn finalize_context(&mut self) {
        let Some(graph) = &self.context else {
            return;
        };
        for (_, score) in self.beam.iter_mut() {
            score.context_score += graph.finalize(score.context_state);
            score.context_state = ContextGraph::ROOT;
        }
        self.beam.sort_by(rank);
    }
}
