//! Batched encoder and attention-rescoring front end over an [`AcousticModel`].
//!
//! Each engine owns one model fork and the encoder outputs of the last encoder
//! call. Sessions never share an engine: they each take a [`fork`] of the
//! server-wide template, so the mutable inference state and the cached encoder
//! outputs are private to the session that produced them.
//!
//! [`fork`]: BatchInferenceEngine::fork

use tracing::debug;

use crate::asr::rescoring::{compute_attention_score, fuse_scores};
use crate::error::{AppError, Result};
use crate::model::{
    AcousticModel, BatchedFeatures, Device, EncoderOutput, LogProbMatrix, ModelInfo,
    PaddedHypotheses, TokenId,
};

pub struct BatchInferenceEngine {
    model: Box<dyn AcousticModel>,
    encoder_cache: Vec<EncoderOutput>,
}

impl std::fmt::Debug for BatchInferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchInferenceEngine")
            .field("device", &self.model.device())
            .field("cached_utterances", &self.encoder_cache.len())
            .finish()
    }
}

impl BatchInferenceEngine {
    pub fn new(model: Box<dyn AcousticModel>) -> Self {
        Self {
            model,
            encoder_cache: Vec::new(),
        }
    }

    /// A new engine sharing the model weights, with empty per-call state.
    pub fn fork(&self) -> Self {
        Self::new(self.model.fork())
    }

    pub fn info(&self) -> ModelInfo {
        self.model.info()
    }

    pub fn subsampling_rate(&self) -> usize {
        self.model.subsampling_rate()
    }

    pub fn right_context(&self) -> usize {
        self.model.right_context()
    }

    pub fn device(&self) -> Device {
        self.model.device()
    }

    fn release_after_call(&mut self) {
        if self.model.device().is_accelerator() {
            self.model.release_transient_buffers();
        }
    }

    /// Run the encoder once over the whole batch.
    ///
    /// The per-utterance encoder outputs replace the engine's cache and stay there
    /// for later rescoring calls; the returned CTC log-probabilities are trimmed to
    /// each utterance's valid encoder frames.
    ///
    /// # Errors
    /// `ShapeMismatch` if the batch is empty or feature dims differ; this is
    /// checked before the model is invoked.
    pub fn forward_encoder(&mut self, features: &BatchedFeatures) -> Result<Vec<LogProbMatrix>> {
        let padded = features.pad()?;
        self.encoder_cache.clear();

        let result = self.model.forward_encoder(&padded);
        self.release_after_call();
        let forward = result?;

        if forward.outputs.len() != padded.batch_size
            || forward.ctc_log_probs.len() != padded.batch_size
        {
            return Err(AppError::DecodeFailure(format!(
                "encoder returned {} outputs and {} CTC matrices for a batch of {}",
                forward.outputs.len(),
                forward.ctc_log_probs.len(),
                padded.batch_size
            )));
        }

        let vocab_size = self.model.vocab_size();
        let mut ctc_log_probs = Vec::with_capacity(padded.batch_size);
        for (b, (output, mut ctc)) in forward
            .outputs
            .iter()
            .zip(forward.ctc_log_probs)
            .enumerate()
        {
            if ctc.cols() != vocab_size || ctc.rows() < output.valid_frames {
                return Err(AppError::DecodeFailure(format!(
                    "utterance {}: CTC output is {}x{}, expected at least {}x{}",
                    b,
                    ctc.rows(),
                    ctc.cols(),
                    output.valid_frames,
                    vocab_size
                )));
            }
            ctc.truncate_rows(output.valid_frames);
            ctc_log_probs.push(ctc);
        }

        debug!(
            batch_size = padded.batch_size,
            num_frames = padded.num_frames,
            "Encoder forward complete"
        );
        self.encoder_cache = forward.outputs;
        Ok(ctc_log_probs)
    }

    /// Encoder output cached for `batch_index` by the last encoder call.
    pub fn encoder_output(&self, batch_index: usize) -> Option<&EncoderOutput> {
        self.encoder_cache.get(batch_index)
    }

    pub fn cached_utterances(&self) -> usize {
        self.encoder_cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.encoder_cache.clear();
    }

    /// Fused attention scores for one utterance's hypotheses, in input order.
    ///
    /// An empty hypothesis list returns immediately without touching the model.
    pub fn attention_rescoring(
        &mut self,
        batch_index: usize,
        hypotheses: &[Vec<TokenId>],
        reverse_weight: f32,
    ) -> Result<Vec<f32>> {
        if hypotheses.is_empty() {
            return Ok(Vec::new());
        }
        let mut scores = self.rescore(&[(batch_index, hypotheses)], reverse_weight)?;
        Ok(scores.pop().unwrap_or_default())
    }

    /// Fused attention scores for every cached utterance in one decoder call.
    ///
    /// `groups[i]` holds the hypotheses of utterance `i` of the last encoder batch.
    /// Scores are identical to calling [`attention_rescoring`] per utterance.
    ///
    /// [`attention_rescoring`]: BatchInferenceEngine::attention_rescoring
    pub fn batch_attention_rescoring(
        &mut self,
        groups: &[Vec<Vec<TokenId>>],
        reverse_weight: f32,
    ) -> Result<Vec<Vec<f32>>> {
        let requests: Vec<(usize, &[Vec<TokenId>])> = groups
            .iter()
            .enumerate()
            .filter(|(_, hyps)| !hyps.is_empty())
            .map(|(i, hyps)| (i, hyps.as_slice()))
            .collect();
        let mut results = vec![Vec::new(); groups.len()];
        if requests.is_empty() {
            return Ok(results);
        }
        let scores = self.rescore(&requests, reverse_weight)?;
        for ((index, _), group_scores) in requests.iter().zip(scores) {
            results[*index] = group_scores;
        }
        Ok(results)
    }

    fn rescore(
        &mut self,
        requests: &[(usize, &[Vec<TokenId>])],
        reverse_weight: f32,
    ) -> Result<Vec<Vec<f32>>> {
        let padded = self.pad_hypotheses(requests)?;
        let result = {
            let encoders = requests
                .iter()
                .map(|(index, _)| {
                    self.encoder_cache.get(*index).ok_or_else(|| {
                        AppError::DecodeFailure(format!(
                            "no encoder output for utterance {}",
                            index
                        ))
                    })
                })
                .collect::<Result<Vec<&EncoderOutput>>>()?;
            self.model
                .forward_decoder(&encoders, &padded, reverse_weight)
        };
        self.release_after_call();
        let output = result?;

        let use_backward = self.model.supports_bidirectional_decoding() && reverse_weight > 0.0;
        let backward = match (use_backward, output.backward.as_ref()) {
            (true, Some(backward)) => Some(backward),
            (true, None) => {
                return Err(AppError::DecodeFailure(
                    "bidirectional model returned no backward scores".to_string(),
                ))
            }
            (false, _) => None,
        };

        let eos = self.model.end_marker_id();
        let vocab_size = self.model.vocab_size();
        let check = |matrices: &[LogProbMatrix], direction: &str| -> Result<()> {
            if matrices.len() != padded.num_hypotheses() {
                return Err(AppError::DecodeFailure(format!(
                    "{} decoder returned {} matrices for {} hypotheses",
                    direction,
                    matrices.len(),
                    padded.num_hypotheses()
                )));
            }
            for (i, m) in matrices.iter().enumerate() {
                if m.cols() != vocab_size || m.rows() < padded.lengths[i] {
                    return Err(AppError::DecodeFailure(format!(
                        "{} decoder output {} is {}x{}",
                        direction,
                        i,
                        m.rows(),
                        m.cols()
                    )));
                }
            }
            Ok(())
        };
        check(&output.forward, "forward")?;
        if let Some(backward) = backward {
            check(backward, "backward")?;
        }

        let mut next = 0;
        let mut scores = Vec::with_capacity(requests.len());
        for (_, hyps) in requests {
            let mut group = Vec::with_capacity(hyps.len());
            for hyp in hyps.iter() {
                let forward_score = compute_attention_score(&output.forward[next], hyp, eos);
                let backward_score = match backward {
                    Some(backward) => {
                        let reversed: Vec<TokenId> = hyp.iter().rev().copied().collect();
                        compute_attention_score(&backward[next], &reversed, eos)
                    }
                    None => 0.0,
                };
                group.push(fuse_scores(forward_score, backward_score, reverse_weight));
                next += 1;
            }
            scores.push(group);
        }

        debug!(
            utterances = requests.len(),
            hypotheses = next,
            bidirectional = backward.is_some(),
            "Attention rescoring complete"
        );
        Ok(scores)
    }

    /// Prefix every hypothesis with the start marker and pad with the end marker.
    fn pad_hypotheses(&self, requests: &[(usize, &[Vec<TokenId>])]) -> Result<PaddedHypotheses> {
        let sos = self.model.start_marker_id();
        let eos = self.model.end_marker_id();
        let vocab_size = self.model.vocab_size() as TokenId;

        let max_len = requests
            .iter()
            .flat_map(|(_, hyps)| hyps.iter().map(Vec::len))
            .max()
            .unwrap_or(0)
            + 1;
        let count: usize = requests.iter().map(|(_, hyps)| hyps.len()).sum();

        let mut padded = PaddedHypotheses {
            tokens: Vec::with_capacity(count * max_len),
            lengths: Vec::with_capacity(count),
            max_len,
            owners: Vec::with_capacity(count),
        };
        for (owner, (_, hyps)) in requests.iter().enumerate() {
            for hyp in hyps.iter() {
                if let Some(bad) = hyp.iter().find(|&&t| t < 0 || t >= vocab_size) {
                    return Err(AppError::ShapeMismatch(format!(
                        "token {} outside vocabulary of {}",
                        bad, vocab_size
                    )));
                }
                padded.tokens.push(sos);
                padded.tokens.extend_from_slice(hyp);
                padded
                    .tokens
                    .extend(std::iter::repeat(eos).take(max_len - hyp.len() - 1));
                padded.lengths.push(hyp.len() + 1);
                padded.owners.push(owner);
            }
        }
        Ok(padded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{
        context_of, expected_backward, expected_forward, frames_for_tokens, MockModel,
    };
    use crate::model::Matrix;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn encoded(model: MockModel, utterances: &[&[TokenId]]) -> BatchInferenceEngine {
        let mut engine = BatchInferenceEngine::new(Box::new(model));
        let batch = BatchedFeatures::new(utterances.iter().map(|u| frames_for_tokens(u)).collect());
        engine.forward_encoder(&batch).unwrap();
        engine
    }

    #[test]
    fn test_zero_reverse_weight_returns_forward_score() {
        let mut engine = encoded(MockModel::new().bidirectional(), &[&[1, 0, 2]]);
        let ctx = context_of(engine.encoder_output(0).unwrap());
        let hyps = vec![vec![1, 2], vec![3]];
        let scores = engine.attention_rescoring(0, &hyps, 0.0).unwrap();
        assert!(close(scores[0], expected_forward(&[1, 2], ctx)));
        assert!(close(scores[1], expected_forward(&[3], ctx)));
    }

    #[test]
    fn test_unidirectional_model_ignores_backward() {
        let mut engine = encoded(MockModel::new(), &[&[1, 0, 2]]);
        let ctx = context_of(engine.encoder_output(0).unwrap());
        let scores = engine.attention_rescoring(0, &[vec![1, 2]], 0.4).unwrap();
        assert!(close(scores[0], expected_forward(&[1, 2], ctx) * 0.6));
    }

    #[test]
    fn test_bidirectional_fusion() {
        let mut engine = encoded(MockModel::new().bidirectional(), &[&[4, 5]]);
        let ctx = context_of(engine.encoder_output(0).unwrap());
        let scores = engine.attention_rescoring(0, &[vec![4, 5, 6]], 0.3).unwrap();
        let expected =
            expected_forward(&[4, 5, 6], ctx) * 0.7 + expected_backward(&[4, 5, 6], ctx) * 0.3;
        assert!(close(scores[0], expected));
    }

    #[test]
    fn test_padding_does_not_leak_across_hypotheses() {
        let mut engine = encoded(MockModel::new().bidirectional(), &[&[1, 2, 3]]);
        let short = engine
            .attention_rescoring(0, &[vec![1, 2, 3], vec![4]], 0.5)
            .unwrap();
        let long = engine
            .attention_rescoring(0, &[vec![1, 2, 3], vec![4, 5, 6, 1, 2, 3]], 0.5)
            .unwrap();
        assert_eq!(short[0], long[0]);
    }

    #[test]
    fn test_empty_hypotheses_skip_the_model() {
        let model = MockModel::new();
        let counters = model.counters.clone();
        let mut engine = encoded(model, &[&[1]]);

        assert!(engine.attention_rescoring(0, &[], 0.5).unwrap().is_empty());
        let groups = engine
            .batch_attention_rescoring(&[Vec::new()], 0.5)
            .unwrap();
        assert_eq!(groups, vec![Vec::<f32>::new()]);
        assert_eq!(counters.decoder_calls(), 0);
    }

    #[test]
    fn test_mismatched_feature_dims_fail_before_model_call() {
        let model = MockModel::new();
        let counters = model.counters.clone();
        let mut engine = BatchInferenceEngine::new(Box::new(model));
        let a = Matrix::from_rows(vec![vec![1.0]]).unwrap();
        let b = Matrix::from_rows(vec![vec![1.0, 2.0]]).unwrap();

        let err = engine
            .forward_encoder(&BatchedFeatures::new(vec![a, b]))
            .unwrap_err();
        assert!(matches!(err, AppError::ShapeMismatch(_)));
        assert_eq!(counters.encoder_calls(), 0);
    }

    #[test]
    fn test_batch_and_single_paths_agree() {
        let mut engine = encoded(MockModel::new().bidirectional(), &[&[1, 0, 2], &[3, 3, 0, 4, 5]]);
        let groups = vec![vec![vec![1, 2], vec![1]], vec![vec![3, 4, 5], vec![3, 4], vec![]]];

        let batched = engine.batch_attention_rescoring(&groups, 0.3).unwrap();
        for (i, hyps) in groups.iter().enumerate() {
            let single = engine.attention_rescoring(i, hyps, 0.3).unwrap();
            assert_eq!(batched[i], single);
        }
        // Each utterance is scored against its own encoder output.
        assert!(batched[0][0] != batched[1][0]);
    }

    #[test]
    fn test_ctc_trimmed_to_valid_frames() {
        let mut engine = BatchInferenceEngine::new(Box::new(MockModel::new()));
        let batch = BatchedFeatures::new(vec![frames_for_tokens(&[1, 2, 3]), frames_for_tokens(&[4])]);
        let ctc = engine.forward_encoder(&batch).unwrap();
        assert_eq!(ctc[0].rows(), 3);
        assert_eq!(ctc[1].rows(), 1);
        assert_eq!(engine.cached_utterances(), 2);
    }

    #[test]
    fn test_release_hook_runs_only_on_accelerator() {
        let cpu = MockModel::new();
        let cpu_counters = cpu.counters.clone();
        let mut engine = encoded(cpu, &[&[1, 2]]);
        engine.attention_rescoring(0, &[vec![1, 2]], 0.0).unwrap();
        assert_eq!(cpu_counters.released(), 0);

        let gpu = MockModel::new().on_device(Device::Cuda(0));
        let gpu_counters = gpu.counters.clone();
        let mut engine = encoded(gpu, &[&[1, 2]]);
        engine.attention_rescoring(0, &[vec![1, 2]], 0.0).unwrap();
        assert_eq!(gpu_counters.released(), 2);
    }

    #[test]
    fn test_rescoring_unknown_utterance_fails() {
        let mut engine = encoded(MockModel::new(), &[&[1]]);
        let err = engine.attention_rescoring(3, &[vec![1]], 0.0).unwrap_err();
        assert!(matches!(err, AppError::DecodeFailure(_)));

        let err = engine.attention_rescoring(0, &[vec![42]], 0.0).unwrap_err();
        assert!(matches!(err, AppError::ShapeMismatch(_)));
    }

    #[test]
    fn test_fork_starts_with_empty_cache() {
        let engine = encoded(MockModel::new(), &[&[1]]);
        let fork = engine.fork();
        assert_eq!(engine.cached_utterances(), 1);
        assert_eq!(fork.cached_utterances(), 0);
    }
}
