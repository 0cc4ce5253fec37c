//! Decoding options shared by every session and the per-session configuration.

use serde::{Deserialize, Serialize};

use crate::asr::endpoint::EndpointConfig;
use crate::error::{AppError, Result};
use crate::model::TokenId;

/// Server-wide decoding options, fixed at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Prefixes kept after each CTC frame.
    pub beam_size: usize,
    /// Tokens considered per CTC frame before prefix expansion.
    pub first_beam_size: usize,
    /// Encoder output frames accumulated before a streaming decode step.
    /// Zero disables streaming steps: the utterance is decoded at finalization only.
    pub chunk_size: usize,
    /// Weight of the CTC prefix score in the final ranking.
    pub ctc_weight: f32,
    /// Weight of the attention score in the final ranking; zero keeps the CTC ranking.
    pub rescoring_weight: f32,
    pub blank_id: TokenId,
    /// Feature frame shift, used for timestamps and endpoint timing.
    pub frame_shift_ms: u32,
    /// Automatic endpoint detection; `None` leaves endpointing to the client.
    pub endpoint: Option<EndpointConfig>,
    /// Feature frames after which an utterance is cut as if an endpoint fired.
    /// Every streaming step re-encodes the whole utterance, so this bounds the
    /// per-step cost when endpointing is off. Zero means no limit.
    pub max_utterance_frames: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            beam_size: 10,
            first_beam_size: 10,
            chunk_size: 16,
            ctc_weight: 0.5,
            rescoring_weight: 1.0,
            blank_id: 0,
            frame_shift_ms: 10,
            endpoint: Some(EndpointConfig::default()),
            max_utterance_frames: 6000,
        }
    }
}

impl DecodeOptions {
    pub fn rescoring_enabled(&self) -> bool {
        self.rescoring_weight > 0.0
    }
}

/// Per-session options. Immutable once the session's decoder is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub nbest: usize,
    pub enable_timestamp: bool,
    pub context_words: Vec<String>,
    /// Bonus added per matched context token.
    pub context_score: f32,
    pub language: String,
    pub continuous_decoding: bool,
    /// Weight of the right-to-left decoder in bidirectional rescoring.
    pub reverse_weight: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            nbest: 1,
            enable_timestamp: false,
            context_words: Vec::new(),
            context_score: 3.0,
            language: "chs".to_string(),
            continuous_decoding: false,
            reverse_weight: 0.0,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nbest == 0 {
            return Err(AppError::InvalidInput("nbest must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.reverse_weight) {
            return Err(AppError::InvalidInput(format!(
                "reverse_weight must be within [0, 1], got {}",
                self.reverse_weight
            )));
        }
        if !self.context_score.is_finite() {
            return Err(AppError::InvalidInput(
                "context_score must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());

        let config = SessionConfig {
            nbest: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::InvalidInput(_))));

        let config = SessionConfig {
            reverse_weight: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rescoring_enabled_follows_weight() {
        let mut options = DecodeOptions::default();
        assert!(options.rescoring_enabled());
        options.rescoring_weight = 0.0;
        assert!(!options.rescoring_enabled());
    }
}
