//! Deterministic model, feature extractor and resources for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::asr::features::{FeatureExtractor, FeatureExtractorFactory};
use crate::asr::options::DecodeOptions;
use crate::asr::resource::DecodeResources;
use crate::asr::types::Vocabulary;
use crate::asr::BatchInferenceEngine;
use crate::error::{AppError, Result};
use crate::model::{
    AcousticModel, DecoderOutput, Device, EncoderForward, EncoderOutput, FeatureSequence, Matrix,
    PaddedBatch, PaddedHypotheses, TokenId,
};

pub(crate) const VOCAB: &str = "<blank> 0\na 1\nb 2\nc 3\nd 4\ne 5\nf 6\n<sos/eos> 7\n";
pub(crate) const VOCAB_SIZE: usize = 8;
pub(crate) const EOS: TokenId = 7;

#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    pub encoder_calls: Arc<AtomicUsize>,
    pub decoder_calls: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl Counters {
    pub fn encoder_calls(&self) -> usize {
        self.encoder_calls.load(Ordering::SeqCst)
    }

    pub fn decoder_calls(&self) -> usize {
        self.decoder_calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// CTC emits `round(frame[0])` with certainty; the decoder scores are a fixed
/// function of (previous token, candidate token, utterance length).
#[derive(Debug, Clone)]
pub(crate) struct MockModel {
    pub bidirectional: bool,
    pub device: Device,
    pub fail_encoder: bool,
    pub fail_decoder: bool,
    pub counters: Counters,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            bidirectional: false,
            device: Device::Cpu,
            fail_encoder: false,
            fail_decoder: false,
            counters: Counters::default(),
        }
    }

    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

pub(crate) fn context_of(encoder: &EncoderOutput) -> f32 {
    0.05 * encoder.valid_frames as f32
}

pub(crate) fn forward_cell(prev: TokenId, k: TokenId) -> f32 {
    -(1.0 + ((prev + k) % 7) as f32) / 10.0
}

pub(crate) fn backward_cell(prev: TokenId, k: TokenId) -> f32 {
    -(1.0 + ((prev + 2 * k) % 5) as f32) / 10.0
}

fn expected(hyp: &[TokenId], ctx: f32, cell: fn(TokenId, TokenId) -> f32) -> f32 {
    let mut prev = EOS;
    let mut score = 0.0;
    for &token in hyp {
        score += cell(prev, token) - ctx;
        prev = token;
    }
    score + cell(prev, EOS) - ctx
}

/// Left-to-right attention score the mock produces for `hyp`.
pub(crate) fn expected_forward(hyp: &[TokenId], ctx: f32) -> f32 {
    expected(hyp, ctx, forward_cell)
}

/// Right-to-left attention score the mock produces for `hyp`.
pub(crate) fn expected_backward(hyp: &[TokenId], ctx: f32) -> f32 {
    let reversed: Vec<TokenId> = hyp.iter().rev().copied().collect();
    expected(&reversed, ctx, backward_cell)
}

fn score_rows(row: &[TokenId], ctx: f32, cell: fn(TokenId, TokenId) -> f32) -> Matrix {
    let mut out = Matrix::zeros(row.len(), VOCAB_SIZE);
    for (j, &prev) in row.iter().enumerate() {
        for (k, v) in out.row_mut(j).iter_mut().enumerate() {
            *v = cell(prev, k as TokenId) - ctx;
        }
    }
    out
}

impl AcousticModel for MockModel {
    fn subsampling_rate(&self) -> usize {
        1
    }

    fn right_context(&self) -> usize {
        0
    }

    fn start_marker_id(&self) -> TokenId {
        EOS
    }

    fn end_marker_id(&self) -> TokenId {
        EOS
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn supports_bidirectional_decoding(&self) -> bool {
        self.bidirectional
    }

    fn device(&self) -> Device {
        self.device
    }

    fn forward_encoder(&mut self, batch: &PaddedBatch) -> Result<EncoderForward> {
        self.counters.encoder_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_encoder {
            return Err(AppError::DecodeFailure("mock encoder failure".to_string()));
        }
        let mut outputs = Vec::new();
        let mut ctc_log_probs = Vec::new();
        for b in 0..batch.batch_size {
            let mut hidden = Matrix::with_cols(batch.feature_dim);
            let mut ctc = Matrix::zeros(batch.num_frames, VOCAB_SIZE);
            for t in 0..batch.num_frames {
                let frame = batch.frame(b, t);
                if t < batch.lengths[b] {
                    hidden.push_row(frame)?;
                }
                let token = (frame[0].round() as usize).min(VOCAB_SIZE - 2);
                for (k, v) in ctc.row_mut(t).iter_mut().enumerate() {
                    *v = if k == token { 0.0 } else { -8.0 };
                }
            }
            outputs.push(EncoderOutput {
                hidden,
                valid_frames: batch.lengths[b],
            });
            ctc_log_probs.push(ctc);
        }
        Ok(EncoderForward {
            outputs,
            ctc_log_probs,
        })
    }

    fn forward_decoder(
        &mut self,
        encoders: &[&EncoderOutput],
        hyps: &PaddedHypotheses,
        reverse_weight: f32,
    ) -> Result<DecoderOutput> {
        self.counters.decoder_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_decoder {
            return Err(AppError::DecodeFailure("mock decoder failure".to_string()));
        }
        let mut forward = Vec::new();
        let mut backward = Vec::new();
        for i in 0..hyps.num_hypotheses() {
            let ctx = context_of(encoders[hyps.owners[i]]);
            let row = hyps.row(i);
            forward.push(score_rows(row, ctx, forward_cell));

            let len = hyps.lengths[i];
            let mut reversed = vec![EOS];
            reversed.extend(row[1..len].iter().rev());
            reversed.resize(hyps.max_len, EOS);
            backward.push(score_rows(&reversed, ctx, backward_cell));
        }
        let run_backward = self.bidirectional && reverse_weight > 0.0;
        Ok(DecoderOutput {
            forward,
            backward: run_backward.then_some(backward),
        })
    }

    fn fork(&self) -> Box<dyn AcousticModel> {
        Box::new(self.clone())
    }

    fn release_transient_buffers(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// One feature frame per sample: `frame[0] = round(sample * 32768 / 1000)`.
#[derive(Debug, Default)]
pub(crate) struct TokenFrameExtractor {
    pending: Vec<f32>,
}

impl FeatureExtractor for TokenFrameExtractor {
    fn feature_dim(&self) -> usize {
        1
    }

    fn accept_waveform(&mut self, samples: &[f32]) -> Result<()> {
        self.pending
            .extend(samples.iter().map(|s| (s * 32768.0 / 1000.0).round()));
        Ok(())
    }

    fn take_frames(&mut self) -> FeatureSequence {
        let mut frames = Matrix::with_cols(1);
        for value in self.pending.drain(..) {
            let _ = frames.push_row(&[value]);
        }
        frames
    }

    fn set_input_finished(&mut self) {}

    fn reset(&mut self) {
        self.pending.clear();
    }
}

pub(crate) fn token_frame_factory() -> FeatureExtractorFactory {
    Arc::new(|| Box::new(TokenFrameExtractor::default()) as Box<dyn FeatureExtractor>)
}

/// PCM16 LE audio whose samples map back to `tokens` through [`TokenFrameExtractor`].
pub(crate) fn pcm_for_tokens(tokens: &[TokenId]) -> Vec<u8> {
    tokens
        .iter()
        .flat_map(|&t| ((t * 1000) as i16).to_le_bytes())
        .collect()
}

/// Feature frames that the mock CTC head decodes as `tokens` (0 is blank).
pub(crate) fn frames_for_tokens(tokens: &[TokenId]) -> FeatureSequence {
    let mut frames = Matrix::with_cols(1);
    for &t in tokens {
        let _ = frames.push_row(&[t as f32]);
    }
    frames
}

pub(crate) fn vocabulary() -> Vocabulary {
    Vocabulary::parse(VOCAB).unwrap()
}

/// Options with streaming steps every `chunk_size` frames and no automatic endpointing.
pub(crate) fn options(chunk_size: usize) -> DecodeOptions {
    DecodeOptions {
        beam_size: 4,
        first_beam_size: 4,
        chunk_size,
        endpoint: None,
        ..Default::default()
    }
}

pub(crate) fn resources(model: MockModel, options: DecodeOptions) -> Arc<DecodeResources> {
    Arc::new(DecodeResources::new(
        BatchInferenceEngine::new(Box::new(model)),
        vocabulary(),
        options,
        token_frame_factory(),
    ))
}
