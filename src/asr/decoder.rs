//! Per-utterance streaming decoder.
//!
//! [`UtteranceDecoder`] owns everything one session needs to decode: its own
//! engine fork, a feature extractor, the CTC search and an endpoint detector.
//! Each streaming step re-encodes the utterance's accumulated features and
//! feeds only the CTC frames the search has not seen yet, so earlier frames
//! are never decoded twice. The cached encoder output of the last step is
//! what attention rescoring reads at finalization.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::asr::ctc::CtcPrefixBeamSearch;
use crate::asr::endpoint::EndpointDetector;
use crate::asr::engine::BatchInferenceEngine;
use crate::asr::features::FeatureExtractor;
use crate::asr::options::{DecodeOptions, SessionConfig};
use crate::asr::rescoring::rank_hypotheses;
use crate::asr::types::{DecodeResult, Vocabulary};
use crate::error::Result;
use crate::model::{BatchedFeatures, FeatureSequence, Matrix, TokenId};

/// What a call to [`UtteranceDecoder::decode_step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Not enough new audio for a decode step.
    NeedMoreData,
    /// New frames were decoded; `changed` is set when the best hypothesis moved.
    Decoded { changed: bool },
    /// The endpoint detector fired; the utterance should be finalized.
    EndpointDetected,
}

pub struct UtteranceDecoder {
    engine: BatchInferenceEngine,
    extractor: Box<dyn FeatureExtractor>,
    search: CtcPrefixBeamSearch,
    endpoint: Option<Box<dyn EndpointDetector>>,
    vocabulary: Arc<Vocabulary>,
    options: DecodeOptions,
    config: Arc<SessionConfig>,
    features: FeatureSequence,
    /// Feature frames covered by the last encoder run.
    encoded_frames: usize,
    /// Start of the current utterance within the stream.
    offset_ms: u64,
}

impl UtteranceDecoder {
    pub(crate) fn new(
        engine: BatchInferenceEngine,
        extractor: Box<dyn FeatureExtractor>,
        endpoint: Option<Box<dyn EndpointDetector>>,
        vocabulary: Arc<Vocabulary>,
        options: DecodeOptions,
        config: Arc<SessionConfig>,
    ) -> Self {
        let search = CtcPrefixBeamSearch::for_session(&options, &config, &vocabulary);
        let features = Matrix::with_cols(extractor.feature_dim());
        Self {
            engine,
            extractor,
            search,
            endpoint,
            vocabulary,
            options,
            config,
            features,
            encoded_frames: 0,
            offset_ms: 0,
        }
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    /// Duration of one encoder frame in milliseconds.
    pub fn frame_ms(&self) -> u64 {
        self.options.frame_shift_ms as u64 * self.engine.subsampling_rate() as u64
    }

    pub fn num_feature_frames(&self) -> usize {
        self.features.rows()
    }

    pub fn accept_waveform(&mut self, samples: &[f32]) -> Result<()> {
        self.extractor.accept_waveform(samples)?;
        self.collect_features()
    }

    fn collect_features(&mut self) -> Result<()> {
        let frames = self.extractor.take_frames();
        if !frames.is_empty() {
            self.features.append(&frames)?;
        }
        Ok(())
    }

    fn decoded_something(&self) -> bool {
        !self.search.best().is_empty()
    }

    /// Run a streaming step once a full chunk of new audio is available.
    pub fn decode_step(&mut self) -> Result<StepOutcome> {
        if self.options.chunk_size == 0 {
            return Ok(StepOutcome::NeedMoreData);
        }
        let pending = self.features.rows() - self.encoded_frames;
        if pending < self.options.chunk_size * self.engine.subsampling_rate() {
            return Ok(StepOutcome::NeedMoreData);
        }

        let changed = self.advance(false)?;
        let limit = self.options.max_utterance_frames;
        if limit > 0 && self.features.rows() >= limit {
            debug!(frames = self.features.rows(), limit, "Utterance length limit reached");
            return Ok(StepOutcome::EndpointDetected);
        }
        if let Some(endpoint) = &self.endpoint {
            if endpoint.is_endpoint(self.decoded_something()) {
                debug!(
                    frames = self.search.frames_consumed(),
                    "Endpoint detected"
                );
                return Ok(StepOutcome::EndpointDetected);
            }
        }
        Ok(StepOutcome::Decoded { changed })
    }

    /// Encode the whole utterance and search the CTC frames not yet consumed.
    ///
    /// Outside finalization the last encoder frames, which may still change
    /// as more audio arrives, are held back.
    fn advance(&mut self, finishing: bool) -> Result<bool> {
        let batch = BatchedFeatures::new(vec![self.features.clone()]);
        let ctc = self.engine.forward_encoder(&batch)?.pop().unwrap_or_default();
        self.encoded_frames = self.features.rows();

        let stable = if finishing {
            ctc.rows()
        } else {
            (self.features.rows() / self.engine.subsampling_rate().max(1))
                .saturating_sub(self.engine.right_context())
                .min(ctc.rows())
        };
        let consumed = self.search.frames_consumed();
        if stable <= consumed {
            return Ok(false);
        }
        let fresh = ctc.slice_rows(consumed, stable);
        let changed = self.search.search(&fresh);
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.observe(&fresh);
        }
        trace!(
            new_frames = fresh.rows(),
            total_frames = stable,
            changed,
            "Decoded CTC frames"
        );
        Ok(changed)
    }

    /// The running n-best from the CTC search alone.
    pub fn partial_result(&self) -> DecodeResult {
        let ranked = rank_hypotheses(
            self.search.hypotheses(),
            None,
            self.options.ctc_weight,
            self.options.rescoring_weight,
        );
        DecodeResult::from_ranked(
            &ranked,
            &self.config,
            &self.vocabulary,
            self.frame_ms(),
            self.offset_ms,
        )
    }

    /// Tokens of the current best hypothesis.
    pub fn best_tokens(&self) -> &[TokenId] {
        self.search.best()
    }

    /// Decode all remaining audio and produce the ranked result.
    ///
    /// With rescoring enabled the CTC n-best is rescored against this
    /// utterance's encoder output; otherwise the CTC ranking is kept.
    pub fn finalize(&mut self) -> Result<DecodeResult> {
        self.extractor.set_input_finished();
        self.collect_features()?;
        if !self.features.is_empty() {
            self.advance(true)?;
        }
        self.search.finalize_context();

        let hypotheses = self.search.hypotheses();
        let rescore = self.options.rescoring_enabled()
            && !hypotheses.is_empty()
            && self.engine.cached_utterances() > 0;
        let ranked = if rescore {
            let tokens: Vec<Vec<TokenId>> = hypotheses.iter().map(|h| h.tokens.clone()).collect();
            let scores =
                self.engine
                    .attention_rescoring(0, &tokens, self.config.reverse_weight)?;
            rank_hypotheses(
                hypotheses,
                Some(&scores),
                self.options.ctc_weight,
                self.options.rescoring_weight,
            )
        } else {
            rank_hypotheses(
                hypotheses,
                None,
                self.options.ctc_weight,
                self.options.rescoring_weight,
            )
        };

        let result = DecodeResult::from_ranked(
            &ranked,
            &self.config,
            &self.vocabulary,
            self.frame_ms(),
            self.offset_ms,
        );
        debug!(
            frames = self.features.rows(),
            rescored = rescore,
            best = result.best_sentence(),
            "Utterance finalized"
        );
        Ok(result)
    }

    /// Prepare for the next utterance of the same stream.
    pub fn reset(&mut self) {
        self.offset_ms += self.features.rows() as u64 * self.options.frame_shift_ms as u64;
        self.features.clear();
        self.encoded_frames = 0;
        self.search.reset();
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.reset();
        }
        self.extractor.reset();
        self.engine.clear_cache();
    }
}
