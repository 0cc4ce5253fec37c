//! JSON envelope of the streaming WebSocket protocol.
//!
//! Text frames carry control messages tagged by `signal` from the client and
//! by `type` from the server. Binary frames carry 16-bit little-endian mono
//! PCM and never pass through this module.

use serde::{Deserialize, Serialize};

use crate::asr::options::SessionConfig;
use crate::asr::types::{DecodeResult, NbestEntry};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ClientMessage {
    Start(StartRequest),
    /// End of input: finalize and close the session.
    End,
    /// End of speech: finalize the current utterance.
    Endpoint,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| AppError::ProtocolViolation(format!("invalid control message: {}", e)))
    }
}

/// Session options carried by the start message; absent fields take the server defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbest: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_timestamp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuous_decoding: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_weight: Option<f32>,
}

impl StartRequest {
    /// Overlay the request on `defaults` and validate the result.
    pub fn into_config(self, defaults: &SessionConfig) -> Result<SessionConfig> {
        let config = SessionConfig {
            nbest: self.nbest.unwrap_or(defaults.nbest),
            enable_timestamp: self.enable_timestamp.unwrap_or(defaults.enable_timestamp),
            context_words: self
                .context
                .unwrap_or_else(|| defaults.context_words.clone()),
            context_score: self.context_score.unwrap_or(defaults.context_score),
            language: self.language.unwrap_or_else(|| defaults.language.clone()),
            continuous_decoding: self
                .continuous_decoding
                .unwrap_or(defaults.continuous_decoding),
            reverse_weight: self.reverse_weight.unwrap_or(defaults.reverse_weight),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerReady { session_id: String },
    PartialResult { nbest: Vec<NbestEntry> },
    FinalResult { nbest: Vec<NbestEntry> },
    SpeechEnd,
    Error { kind: String, message: String },
}

impl ServerMessage {
    pub fn partial(result: DecodeResult) -> Self {
        ServerMessage::PartialResult {
            nbest: result.nbest,
        }
    }

    pub fn final_result(result: DecodeResult) -> Self {
        ServerMessage::FinalResult {
            nbest: result.nbest,
        }
    }

    pub fn from_error(error: &AppError) -> Self {
        ServerMessage::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerMessage::Error { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
