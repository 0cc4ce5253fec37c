//! Context biasing.
//!
//! Context words are tokenised with the vocabulary and stored in a token trie.
//! While the CTC search extends a prefix, the prefix carries a trie state; each
//! token that continues a match earns `context_score`. When the match breaks
//! before reaching the end of a word the bonus earned on the unfinished part is
//! refunded, so only completed context words keep their boost.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::asr::types::Vocabulary;
use crate::model::TokenId;

/// Position in the context trie. [`ContextGraph::ROOT`] means "no partial match".
pub type ContextState = usize;

#[derive(Debug, Clone, Default)]
struct Node {
    children: HashMap<TokenId, usize>,
    parent: usize,
    depth: usize,
    is_end: bool,
}

#[derive(Debug, Clone)]
pub struct ContextGraph {
    nodes: Vec<Node>,
    score: f32,
}

impl ContextGraph {
    pub const ROOT: ContextState = 0;

    pub fn new(score: f32) -> Self {
        Self {
            nodes: vec![Node::default()],
            score,
        }
    }

    /// Tokenise `words` with `vocabulary` and add each one.
    ///
    /// Words that cannot be expressed with the vocabulary are skipped.
    pub fn from_words<S: AsRef<str>>(words: &[S], vocabulary: &Vocabulary, score: f32) -> Self {
        let mut graph = Self::new(score);
        for word in words {
            let word = word.as_ref();
            match vocabulary.encode(word) {
                Some(tokens) if !tokens.is_empty() => graph.add_sequence(&tokens),
                _ => warn!(word, "Skipping context word that cannot be tokenised"),
            }
        }
        debug!(nodes = graph.nodes.len(), "Built context graph");
        graph
    }

    pub fn add_sequence(&mut self, tokens: &[TokenId]) {
        let mut state = Self::ROOT;
        for &token in tokens {
            state = match self.nodes[state].children.get(&token) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    let depth = self.nodes[state].depth + 1;
                    self.nodes.push(Node {
                        children: HashMap::new(),
                        parent: state,
                        depth,
                        is_end: false,
                    });
                    self.nodes[state].children.insert(token, child);
                    child
                }
            };
        }
        if state != Self::ROOT {
            self.nodes[state].is_end = true;
        }
    }

    /// True when no word was added.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    /// Bonus earned since the last completed word on the path to `state`.
    fn pending_bonus(&self, state: ContextState) -> f32 {
        let mut node = state;
        while node != Self::ROOT && !self.nodes[node].is_end {
            node = self.nodes[node].parent;
        }
        (self.nodes[state].depth - self.nodes[node].depth) as f32 * self.score
    }

    fn enter(&self, child: usize) -> ContextState {
        let node = &self.nodes[child];
        if node.is_end && node.children.is_empty() {
            Self::ROOT
        } else {
            child
        }
    }

    /// Follow `token` from `state`, returning the next state and the score delta.
    ///
    /// A matching token adds the bonus. A token that breaks the match refunds
    /// the pending bonus and is then tried as the start of a new match.
    pub fn advance(&self, state: ContextState, token: TokenId) -> (ContextState, f32) {
        if let Some(&child) = self.nodes[state].children.get(&token) {
            return (self.enter(child), self.score);
        }
        let refund = -self.pending_bonus(state);
        match self.nodes[Self::ROOT].children.get(&token) {
            Some(&child) => (self.enter(child), refund + self.score),
            None => (Self::ROOT, refund),
        }
    }

    /// Score delta that closes an utterance ending in `state`.
    pub fn finalize(&self, state: ContextState) -> f32 {
        -self.pending_bonus(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> ContextGraph {
        let mut g = ContextGraph::new(2.0);
        g.add_sequence(&[1, 2, 3]);
        g.add_sequence(&[1, 2]);
        g.add_sequence(&[4]);
        g
    }

    #[test]
    fn test_full_match_keeps_bonus() {
        let g = graph();
        let (s, d1) = g.advance(ContextGraph::ROOT, 1);
        let (s, d2) = g.advance(s, 2);
        let (s, d3) = g.advance(s, 3);
        assert_eq!(d1 + d2 + d3, 6.0);
        assert_eq!(s, ContextGraph::ROOT);
        assert_eq!(g.finalize(s), 0.0);
    }

    #[test]
    fn test_broken_match_refunds_unfinished_part() {
        let g = graph();
        let (s, _) = g.advance(ContextGraph::ROOT, 1);
        let (s, _) = g.advance(s, 2);
        // [1, 2] is itself a word, so breaking after it keeps that bonus.
        let (s, delta) = g.advance(s, 5);
        assert_eq!(delta, 0.0);
        assert_eq!(s, ContextGraph::ROOT);

        let (s, _) = g.advance(ContextGraph::ROOT, 1);
        let (s, delta) = g.advance(s, 5);
        assert_eq!(delta, -2.0);
        assert_eq!(s, ContextGraph::ROOT);
    }

    #[test]
    fn test_break_restarts_match_from_root() {
        let g = graph();
        let (s, _) = g.advance(ContextGraph::ROOT, 1);
        let (s, delta) = g.advance(s, 4);
        // refund -2 for the partial [1], then +2 for the single-token word [4]
        assert_eq!(delta, 0.0);
        assert_eq!(s, ContextGraph::ROOT);
    }

    #[test]
    fn test_finalize_refunds_partial_match() {
        let g = graph();
        let (s, _) = g.advance(ContextGraph::ROOT, 1);
        assert_eq!(g.finalize(s), -2.0);
        assert_eq!(g.finalize(ContextGraph::ROOT), 0.0);
    }

    #[test]
    fn test_from_words_uses_vocabulary() {
        let vocab = Vocabulary::parse("<blank> 0\nhe 1\nllo 2\nx 3\n").unwrap();
        let g = ContextGraph::from_words(&["hello", "zzz"], &vocab, 1.5);
        assert!(!g.is_empty());
        let (s, _) = g.advance(ContextGraph::ROOT, 1);
        let (_, delta) = g.advance(s, 2);
        assert_eq!(delta, 1.5);
        assert!(ContextGraph::new(1.0).is_empty());
    }
}
