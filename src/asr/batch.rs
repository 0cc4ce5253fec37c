//! Offline recognition of several complete utterances at once.
//!
//! All utterances go through one encoder call, each gets its own CTC search,
//! and the resulting n-best lists are rescored together in one decoder call.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::asr::ctc::CtcPrefixBeamSearch;
use crate::asr::features::bytes_to_f32_samples;
use crate::asr::options::SessionConfig;
use crate::asr::rescoring::rank_hypotheses;
use crate::asr::resource::DecodeResources;
use crate::asr::types::{DecodeResult, Hypothesis};
use crate::error::Result;
use crate::model::{BatchedFeatures, FeatureSequence, TokenId};

#[derive(Clone)]
pub struct BatchRecognizer {
    resources: Arc<DecodeResources>,
}

impl BatchRecognizer {
    pub fn new(resources: Arc<DecodeResources>) -> Self {
        Self { resources }
    }

    /// Decode PCM16 LE utterances.
    pub fn decode_pcm(
        &self,
        utterances: &[Vec<u8>],
        config: &SessionConfig,
    ) -> Result<Vec<DecodeResult>> {
        let mut features = Vec::with_capacity(utterances.len());
        for pcm in utterances {
            let samples = bytes_to_f32_samples(pcm)?;
            let mut extractor = self.resources.new_feature_extractor();
            extractor.accept_waveform(&samples)?;
            extractor.set_input_finished();
            features.push(extractor.take_frames());
        }
        self.decode_features(features, config)
    }

    /// Decode feature sequences; results are returned in input order.
    #[instrument(skip_all, fields(utterances = utterances.len()))]
    pub fn decode_features(
        &self,
        utterances: Vec<FeatureSequence>,
        config: &SessionConfig,
    ) -> Result<Vec<DecodeResult>> {
        config.validate()?;
        if utterances.is_empty() {
            return Ok(Vec::new());
        }

        let options = self.resources.options();
        let vocabulary = self.resources.vocabulary();
        let mut engine = self.resources.fork_engine();
        let ctc = engine.forward_encoder(&BatchedFeatures::new(utterances))?;

        let nbest: Vec<Vec<Hypothesis>> = ctc
            .iter()
            .map(|log_probs| {
                let mut search = CtcPrefixBeamSearch::for_session(options, config, vocabulary);
                search.search(log_probs);
                search.finalize_context();
                search.hypotheses()
            })
            .collect();

        let attention = if options.rescoring_enabled() {
            let groups: Vec<Vec<Vec<TokenId>>> = nbest
                .iter()
                .map(|hyps| hyps.iter().map(|h| h.tokens.clone()).collect())
                .collect();
            Some(engine.batch_attention_rescoring(&groups, config.reverse_weight)?)
        } else {
            None
        };

        let frame_ms = options.frame_shift_ms as u64 * engine.subsampling_rate() as u64;
        let results: Vec<DecodeResult> = nbest
            .into_iter()
            .enumerate()
            .map(|(i, hyps)| {
                let scores = attention.as_ref().map(|all| all[i].as_slice());
                let ranked =
                    rank_hypotheses(hyps, scores, options.ctc_weight, options.rescoring_weight);
                DecodeResult::from_ranked(&ranked, config, vocabulary, frame_ms, 0)
            })
            .collect();

        debug!(rescored = attention.is_some(), "Batch decode complete");
        Ok(results)
    }
}
