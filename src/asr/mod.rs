//! Core ASR (Automatic Speech Recognition) functionality.
//!
//! This module contains the decoding layer: the batched inference engine and
//! attention rescoring, incremental CTC prefix beam search with context
//! biasing, endpoint detection, the audio front end, and the per-utterance
//! and offline recognizers built from them.

pub mod batch;
pub mod context;
pub mod ctc;
pub mod decoder;
pub mod endpoint;
pub mod engine;
pub mod features;
pub mod options;
pub mod rescoring;
pub mod resource;
pub mod types;

pub use batch::BatchRecognizer;
pub use context::ContextGraph;
pub use ctc::{CtcPrefixBeamSearch, CtcSearchOptions};
pub use decoder::{StepOutcome, UtteranceDecoder};
pub use endpoint::{
    CtcEndpointDetector, EndpointConfig, EndpointDetector, EndpointDetectorFactory, EndpointRule,
};
pub use engine::BatchInferenceEngine;
pub use features::{
    bytes_to_f32_samples, fbank_factory, FbankExtractor, FeatureConfig, FeatureExtractor,
    FeatureExtractorFactory,
};
pub use options::{DecodeOptions, SessionConfig};
pub use rescoring::{compute_attention_score, fuse_scores, rank_hypotheses, ScoreLookup};
pub use resource::DecodeResources;
pub use types::{DecodeResult, Hypothesis, NbestEntry, RescoredHypothesis, Vocabulary, WordPiece};
