//! Host-facing recognizer with the runtime controls of the embedding API.
//!
//! [`Recognizer`] decodes on the caller's thread: feed PCM with
//! [`Recognizer::decode`] and read the latest partial or final result back.
//! Session options can be changed until the first audio arrives and again
//! after [`Recognizer::reset`].

use std::sync::Arc;

use tracing::{debug, info};

use crate::asr::decoder::{StepOutcome, UtteranceDecoder};
use crate::asr::engine::BatchInferenceEngine;
use crate::asr::features::{bytes_to_f32_samples, fbank_factory};
use crate::asr::options::SessionConfig;
use crate::asr::resource::DecodeResources;
use crate::asr::types::{DecodeResult, Vocabulary};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::model::linear::LinearAcousticModel;
use crate::reliability::set_log_verbosity;
use crate::session::protocol::ServerMessage;

/// Load the model and units named by `config` into shareable decoding resources.
///
/// # Errors
/// `ModelLoad` if the model or units cannot be loaded or the requested device
/// is unavailable, `Configuration` if the model does not fit the feature setup.
pub fn load_resources(config: &Config) -> Result<DecodeResources> {
    let device = config.device()?;
    let model = LinearAcousticModel::load(&config.model_path, device)?;
    if model.feature_dim() != config.feature_dim {
        return Err(AppError::Configuration(format!(
            "model expects {}-dim features, feature_dim is {}",
            model.feature_dim(),
            config.feature_dim
        )));
    }
    let vocabulary = Vocabulary::load_from_file(&config.units_path)?;
    let engine = BatchInferenceEngine::new(Box::new(model));
    let info = engine.info();
    if vocabulary.len() != info.vocab_size {
        return Err(AppError::ModelLoad(format!(
            "units file has {} entries, model vocabulary is {}",
            vocabulary.len(),
            info.vocab_size
        )));
    }
    info!(
        device = %device,
        units = vocabulary.len(),
        subsampling = info.subsampling_rate,
        bidirectional = info.bidirectional_decoder,
        "Decoding resources ready"
    );

    Ok(DecodeResources::new(
        engine,
        vocabulary,
        config.decode_options(),
        fbank_factory(config.feature_config()),
    )
    .with_default_session(config.default_session_config())
    .with_input_queue_capacity(config.input_queue_capacity))
}

/// Set the global log verbosity: 0 is info, 1 debug, 2 and above trace.
pub fn set_log_level(level: u8) -> Result<()> {
    set_log_verbosity(level)
}

pub struct Recognizer {
    resources: Arc<DecodeResources>,
    config: SessionConfig,
    decoder: Option<UtteranceDecoder>,
    result: Option<ServerMessage>,
    finished: bool,
}

impl Recognizer {
    pub fn new(resources: Arc<DecodeResources>) -> Self {
        let config = resources.default_session().clone();
        Self {
            resources,
            config,
            decoder: None,
            result: None,
            finished: false,
        }
    }

    /// Build a recognizer straight from a configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(Arc::new(load_resources(config)?)))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn configure(&mut self, update: impl FnOnce(&mut SessionConfig)) -> Result<()> {
        if self.decoder.is_some() {
            return Err(AppError::InvalidInput(
                "options cannot change while decoding; call reset first".to_string(),
            ));
        }
        let mut config = self.config.clone();
        update(&mut config);
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn set_nbest(&mut self, nbest: usize) -> Result<()> {
        self.configure(|c| c.nbest = nbest)
    }

    pub fn set_timestamp(&mut self, enable: bool) -> Result<()> {
        self.configure(|c| c.enable_timestamp = enable)
    }

    /// Add one context-biasing phrase.
    pub fn add_context(&mut self, word: impl Into<String>) -> Result<()> {
        let word = word.into();
        self.configure(|c| c.context_words.push(word))
    }

    pub fn set_context_score(&mut self, score: f32) -> Result<()> {
        self.configure(|c| c.context_score = score)
    }

    pub fn set_language(&mut self, language: impl Into<String>) -> Result<()> {
        let language = language.into();
        self.configure(|c| c.language = language)
    }

    pub fn set_continuous_decoding(&mut self, enable: bool) -> Result<()> {
        self.configure(|c| c.continuous_decoding = enable)
    }

    /// Drop the current utterance and results; options are kept.
    pub fn reset(&mut self) {
        self.decoder = None;
        self.result = None;
        self.finished = false;
    }

    /// Feed 16-bit little-endian PCM; `last` marks the end of the input.
    pub fn decode(&mut self, pcm: &[u8], last: bool) -> Result<()> {
        let samples = bytes_to_f32_samples(pcm)?;
        if self.finished {
            debug!(samples = samples.len(), "Dropping audio after final result");
            return Ok(());
        }
        let continuous = self.config.continuous_decoding;
        if self.decoder.is_none() {
            self.decoder = Some(self.resources.new_decoder(self.config.clone())?);
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        decoder.accept_waveform(&samples)?;

        loop {
            match decoder.decode_step()? {
                StepOutcome::NeedMoreData => break,
                StepOutcome::Decoded { changed } => {
                    if changed {
                        self.result = Some(ServerMessage::partial(decoder.partial_result()));
                    }
                }
                StepOutcome::EndpointDetected => {
                    self.result = Some(ServerMessage::final_result(decoder.finalize()?));
                    if !continuous {
                        self.finished = true;
                        return Ok(());
                    }
                    decoder.reset();
                }
            }
        }

        if last {
            self.result = Some(ServerMessage::final_result(decoder.finalize()?));
            self.finished = true;
        }
        Ok(())
    }

    /// The latest partial or final result.
    pub fn result(&self) -> Option<&ServerMessage> {
        self.result.as_ref()
    }

    /// Whether the latest result is final.
    pub fn is_final(&self) -> bool {
        matches!(self.result, Some(ServerMessage::FinalResult { .. }))
    }

    /// Latest result as JSON, or an empty string when there is none yet.
    pub fn result_json(&self) -> Result<String> {
        match &self.result {
            Some(message) => message.to_json(),
            None => Ok(String::new()),
        }
    }

    /// Decode one complete utterance, independent of the streaming state.
    pub fn decode_utterance(&self, pcm: &[u8]) -> Result<DecodeResult> {
        let mut decoder = self.resources.new_decoder(self.config.clone())?;
        decoder.accept_waveform(&bytes_to_f32_samples(pcm)?)?;
        decoder.finalize()
    }
}
