//! Automatic endpoint detection.
//!
//! The decoder feeds every new block of CTC log-probabilities to an
//! [`EndpointDetector`] and asks it after each step whether the utterance has
//! ended. The bundled [`CtcEndpointDetector`] counts trailing frames whose blank
//! probability exceeds a threshold and applies three rules, any of which ends
//! the utterance:
//!
//! 1. long silence even if nothing was decoded,
//! 2. shorter silence after something was decoded,
//! 3. a maximum utterance length once something was decoded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{LogProbMatrix, TokenId};

/// One endpointing rule; all conditions must hold for the rule to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    pub must_decode_something: bool,
    pub min_trailing_silence_ms: u64,
    pub min_utterance_length_ms: u64,
}

impl EndpointRule {
    pub const fn new(
        must_decode_something: bool,
        min_trailing_silence_ms: u64,
        min_utterance_length_ms: u64,
    ) -> Self {
        Self {
            must_decode_something,
            min_trailing_silence_ms,
            min_utterance_length_ms,
        }
    }

    fn matches(&self, decoded_something: bool, trailing_silence_ms: u64, utterance_ms: u64) -> bool {
        (decoded_something || !self.must_decode_something)
            && trailing_silence_ms >= self.min_trailing_silence_ms
            && utterance_ms >= self.min_utterance_length_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// A frame counts as silence when its blank probability exceeds this value.
    pub blank_threshold: f32,
    pub rule1: EndpointRule,
    pub rule2: EndpointRule,
    pub rule3: EndpointRule,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            blank_threshold: 0.8,
            rule1: EndpointRule::new(false, 5000, 0),
            rule2: EndpointRule::new(true, 1000, 0),
            rule3: EndpointRule::new(true, 0, 20000),
        }
    }
}

/// Decides when an utterance has ended from the CTC posteriors seen so far.
pub trait EndpointDetector: Send {
    /// Account for newly decoded CTC frames.
    fn observe(&mut self, ctc_log_probs: &LogProbMatrix);

    fn is_endpoint(&self, decoded_something: bool) -> bool;

    /// Start over for a new utterance.
    fn reset(&mut self);
}

pub type EndpointDetectorFactory = Arc<dyn Fn() -> Box<dyn EndpointDetector> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CtcEndpointDetector {
    config: EndpointConfig,
    blank_id: TokenId,
    /// Duration of one CTC frame (feature shift times subsampling).
    frame_ms: u64,
    frames: u64,
    trailing_blank_frames: u64,
}

impl CtcEndpointDetector {
    pub fn new(config: EndpointConfig, blank_id: TokenId, frame_ms: u64) -> Self {
        Self {
            config,
            blank_id,
            frame_ms,
            frames: 0,
            trailing_blank_frames: 0,
        }
    }

    pub fn trailing_silence_ms(&self) -> u64 {
        self.trailing_blank_frames * self.frame_ms
    }

    pub fn utterance_ms(&self) -> u64 {
        self.frames * self.frame_ms
    }
}

impl EndpointDetector for CtcEndpointDetector {
    fn observe(&mut self, ctc_log_probs: &LogProbMatrix) {
        let blank = self.blank_id as usize;
        for row in ctc_log_probs.iter_rows() {
            self.frames += 1;
            let blank_prob = row.get(blank).map(|lp| lp.exp()).unwrap_or(0.0);
            if blank_prob > self.config.blank_threshold {
                self.trailing_blank_frames += 1;
            } else {
                self.trailing_blank_frames = 0;
            }
        }
    }

    fn is_endpoint(&self, decoded_something: bool) -> bool {
        if self.frames == 0 {
            return false;
        }
        let silence = self.trailing_silence_ms();
        let length = self.utterance_ms();
        [self.config.rule1, self.config.rule2, self.config.rule3]
            .iter()
            .any(|rule| rule.matches(decoded_something, silence, length))
    }

    fn reset(&mut self) {
        self.frames = 0;
        self.trailing_blank_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Matrix;

    /// `n` frames over a 3-token vocabulary, blank (id 0) probability `p`.
    fn frames(n: usize, p: f32) -> Matrix {
        let rest = ((1.0 - p) / 2.0).max(1e-6).ln();
        Matrix::from_rows(vec![vec![p.max(1e-6).ln(), rest, rest]; n]).unwrap()
    }

    fn detector() -> CtcEndpointDetector {
        CtcEndpointDetector::new(EndpointConfig::default(), 0, 40)
    }

    #[test]
    fn test_no_frames_is_never_an_endpoint() {
        assert!(!detector().is_endpoint(false));
        assert!(!detector().is_endpoint(true));
    }

    #[test]
    fn test_silence_after_speech() {
        let mut d = detector();
        d.observe(&frames(5, 0.1));
        d.observe(&frames(24, 0.95));
        assert_eq!(d.trailing_silence_ms(), 960);
        assert!(!d.is_endpoint(true));

        d.observe(&frames(1, 0.95));
        assert!(d.is_endpoint(true));
        // Rule 1 needs much longer silence when nothing was decoded.
        assert!(!d.is_endpoint(false));
    }

    #[test]
    fn test_long_silence_without_speech() {
        let mut d = detector();
        d.observe(&frames(125, 0.99));
        assert!(d.is_endpoint(false));
    }

    #[test]
    fn test_speech_resets_trailing_silence() {
        let mut d = detector();
        d.observe(&frames(20, 0.95));
        d.observe(&frames(1, 0.2));
        assert_eq!(d.trailing_silence_ms(), 0);
        assert_eq!(d.utterance_ms(), 840);
    }

    #[test]
    fn test_maximum_utterance_length() {
        let mut d = detector();
        d.observe(&frames(500, 0.1));
        assert!(d.is_endpoint(true));
        assert!(!d.is_endpoint(false));

        d.reset();
        assert_eq!(d.utterance_ms(), 0);
        assert!(!d.is_endpoint(true));
    }
}
