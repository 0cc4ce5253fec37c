//! Read-only decoding resources shared by every session.

use std::sync::Arc;

use crate::asr::decoder::UtteranceDecoder;
use crate::asr::endpoint::{CtcEndpointDetector, EndpointDetector, EndpointDetectorFactory};
use crate::asr::engine::BatchInferenceEngine;
use crate::asr::features::{FeatureExtractor, FeatureExtractorFactory};
use crate::asr::options::{DecodeOptions, SessionConfig};
use crate::asr::types::Vocabulary;
use crate::error::Result;
use crate::model::ModelInfo;

/// Default bound of a session's audio input queue, in chunks.
pub const DEFAULT_INPUT_QUEUE_CAPACITY: usize = 64;

/// The model template, vocabulary and options a decoder is built from.
///
/// Held behind an `Arc` by the server; the engine inside is only ever forked,
/// never run directly, so sessions do not share inference state.
pub struct DecodeResources {
    engine: BatchInferenceEngine,
    vocabulary: Arc<Vocabulary>,
    options: DecodeOptions,
    feature_factory: FeatureExtractorFactory,
    endpoint_factory: Option<EndpointDetectorFactory>,
    default_session: SessionConfig,
    input_queue_capacity: usize,
}

impl DecodeResources {
    pub fn new(
        engine: BatchInferenceEngine,
        vocabulary: Vocabulary,
        options: DecodeOptions,
        feature_factory: FeatureExtractorFactory,
    ) -> Self {
        Self {
            engine,
            vocabulary: Arc::new(vocabulary),
            options,
            feature_factory,
            endpoint_factory: None,
            default_session: SessionConfig::default(),
            input_queue_capacity: DEFAULT_INPUT_QUEUE_CAPACITY,
        }
    }

    /// Replace the built-in CTC endpoint detector.
    pub fn with_endpoint_factory(mut self, factory: EndpointDetectorFactory) -> Self {
        self.endpoint_factory = Some(factory);
        self
    }

    pub fn with_default_session(mut self, config: SessionConfig) -> Self {
        self.default_session = config;
        self
    }

    pub fn with_input_queue_capacity(mut self, capacity: usize) -> Self {
        self.input_queue_capacity = capacity.max(1);
        self
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn default_session(&self) -> &SessionConfig {
        &self.default_session
    }

    pub fn input_queue_capacity(&self) -> usize {
        self.input_queue_capacity
    }

    pub fn model_info(&self) -> ModelInfo {
        self.engine.info()
    }

    /// A fresh engine fork, for callers that drive the engine directly.
    pub fn fork_engine(&self) -> BatchInferenceEngine {
        self.engine.fork()
    }

    pub fn new_feature_extractor(&self) -> Box<dyn FeatureExtractor> {
        (self.feature_factory)()
    }

    fn endpoint_detector(&self) -> Option<Box<dyn EndpointDetector>> {
        if let Some(factory) = &self.endpoint_factory {
            return Some(factory());
        }
        let frame_ms = self.options.frame_shift_ms as u64 * self.engine.subsampling_rate() as u64;
        self.options.endpoint.clone().map(|config| {
            Box::new(CtcEndpointDetector::new(config, self.options.blank_id, frame_ms))
                as Box<dyn EndpointDetector>
        })
    }

    /// Build a decoder with its own engine fork for one session.
    pub fn new_decoder(&self, config: impl Into<Arc<SessionConfig>>) -> Result<UtteranceDecoder> {
        let config = config.into();
        config.validate()?;
        Ok(UtteranceDecoder::new(
            self.engine.fork(),
            self.new_feature_extractor(),
            self.endpoint_detector(),
            Arc::clone(&self.vocabulary),
            self.options.clone(),
            config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::endpoint::EndpointConfig;
    use crate::error::AppError;
    use crate::model::testing::{options, resources, MockModel};

    #[test]
    fn test_new_decoder_validates_config() {
        let res = resources(MockModel::new(), options(4));
        let bad = SessionConfig {
            nbest: 0,
            ..Default::default()
        };
        assert!(matches!(res.new_decoder(bad), Err(AppError::InvalidInput(_))));
        assert!(res.new_decoder(SessionConfig::default()).is_ok());
    }

    #[test]
    fn test_resource_accessors() {
        let res = resources(MockModel::new(), options(4));
        assert_eq!(res.model_info().end_marker_id, 7);
        assert_eq!(res.fork_engine().cached_utterances(), 0);

        let mut opts = options(4);
        opts.endpoint = Some(EndpointConfig::default());
        let res = resources(MockModel::new(), opts);
        assert!(res.endpoint_detector().is_some());
        assert_eq!(res.input_queue_capacity(), DEFAULT_INPUT_QUEUE_CAPACITY);
    }
}
