//! Reference CPU backend for [`AcousticModel`].
//!
//! A small dense network loaded from a JSON weights file:
//!
//! * encoder: mean-pool every `subsampling_rate` feature frames, project to the
//!   hidden size and apply `tanh`;
//! * CTC head: hidden -> vocabulary projection followed by `log_softmax`;
//! * attention decoder: for each input token, `tanh(embedding[token] + context)`
//!   projected to the vocabulary, where `context` is the mean encoder frame of
//!   the hypothesis' utterance. An optional second projection scores the
//!   right-to-left direction.
//!
//! It exists so the runtime can be deployed and exercised end to end without a
//! native inference library. Accelerator devices are rejected at load time.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::model::{
    AcousticModel, DecoderOutput, Device, EncoderForward, EncoderOutput, LogProbMatrix, Matrix,
    PaddedBatch, PaddedHypotheses, TokenId,
};

fn default_subsampling_rate() -> usize {
    4
}

/// On-disk layout of the weights file. Projection matrices are `in x out`.
#[derive(Debug, Deserialize)]
struct WeightsFile {
    feature_dim: usize,
    hidden_dim: usize,
    vocab_size: usize,
    #[serde(default = "default_subsampling_rate")]
    subsampling_rate: usize,
    #[serde(default)]
    right_context: usize,
    #[serde(default)]
    sos: Option<TokenId>,
    #[serde(default)]
    eos: Option<TokenId>,
    encoder: Vec<Vec<f32>>,
    ctc: Vec<Vec<f32>>,
    embedding: Vec<Vec<f32>>,
    decoder: Vec<Vec<f32>>,
    #[serde(default)]
    reverse_decoder: Option<Vec<Vec<f32>>>,
}

#[derive(Debug)]
struct Weights {
    feature_dim: usize,
    hidden_dim: usize,
    vocab_size: usize,
    subsampling_rate: usize,
    right_context: usize,
    sos: TokenId,
    eos: TokenId,
    encoder: Matrix,
    ctc: Matrix,
    embedding: Matrix,
    decoder: Matrix,
    reverse_decoder: Option<Matrix>,
}

fn load_matrix(name: &str, rows: Vec<Vec<f32>>, expected: (usize, usize)) -> Result<Matrix> {
    let matrix = Matrix::from_rows(rows)
        .map_err(|e| AppError::ModelLoad(format!("weights '{}': {}", name, e)))?;
    if (matrix.rows(), matrix.cols()) != expected {
        return Err(AppError::ModelLoad(format!(
            "weights '{}' have shape {}x{}, expected {}x{}",
            name,
            matrix.rows(),
            matrix.cols(),
            expected.0,
            expected.1
        )));
    }
    Ok(matrix)
}

impl TryFrom<WeightsFile> for Weights {
    type Error = AppError;

    fn try_from(file: WeightsFile) -> Result<Self> {
        if file.feature_dim == 0 || file.hidden_dim == 0 || file.vocab_size < 2 {
            return Err(AppError::ModelLoad(
                "feature_dim and hidden_dim must be positive and vocab_size at least 2".to_string(),
            ));
        }
        if file.subsampling_rate == 0 {
            return Err(AppError::ModelLoad(
                "subsampling_rate must be positive".to_string(),
            ));
        }

        let last = file.vocab_size as TokenId - 1;
        let sos = file.sos.unwrap_or(last);
        let eos = file.eos.unwrap_or(last);
        for (name, id) in [("sos", sos), ("eos", eos)] {
            if id < 0 || id > last {
                return Err(AppError::ModelLoad(format!(
                    "{} id {} outside vocabulary of {}",
                    name, id, file.vocab_size
                )));
            }
        }

        let (feat, hid, vocab) = (file.feature_dim, file.hidden_dim, file.vocab_size);
        let reverse_decoder = file
            .reverse_decoder
            .map(|rows| load_matrix("reverse_decoder", rows, (hid, vocab)))
            .transpose()?;

        Ok(Self {
            feature_dim: feat,
            hidden_dim: hid,
            vocab_size: vocab,
            subsampling_rate: file.subsampling_rate,
            right_context: file.right_context,
            sos,
            eos,
            encoder: load_matrix("encoder", file.encoder, (feat, hid))?,
            ctc: load_matrix("ctc", file.ctc, (hid, vocab))?,
            embedding: load_matrix("embedding", file.embedding, (vocab, hid))?,
            decoder: load_matrix("decoder", file.decoder, (hid, vocab))?,
            reverse_decoder,
        })
    }
}

/// `out = input x weights` for an `in x out` weight matrix.
fn project(input: &[f32], weights: &Matrix, out: &mut Vec<f32>) {
    out.clear();
    out.resize(weights.cols(), 0.0);
    for (x, row) in input.iter().zip(weights.iter_rows()) {
        if *x == 0.0 {
            continue;
        }
        for (o, w) in out.iter_mut().zip(row) {
            *o += x * w;
        }
    }
}

fn log_softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = values.iter().map(|v| (v - max).exp()).sum();
    let log_z = max + sum.ln();
    for v in values.iter_mut() {
        *v -= log_z;
    }
}

/// Dense JSON-weights acoustic model running on the CPU.
#[derive(Debug, Clone)]
pub struct LinearAcousticModel {
    weights: Arc<Weights>,
    device: Device,
    scratch: Vec<f32>,
}

impl LinearAcousticModel {
    /// Load weights from a JSON file.
    ///
    /// # Arguments
    /// * `path` - Path to the weights file
    /// * `device` - Requested compute device; only [`Device::Cpu`] is supported
    ///
    /// # Returns
    /// The loaded model, or `ModelLoad` if the device is unavailable or the file
    /// is unreadable or malformed
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        let path = path.as_ref();
        Self::check_device(device)?;
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::ModelLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        let model = Self::from_json(&content, device)?;
        info!(
            path = %path.display(),
            vocab_size = model.weights.vocab_size,
            hidden_dim = model.weights.hidden_dim,
            bidirectional = model.weights.reverse_decoder.is_some(),
            "Loaded linear acoustic model"
        );
        Ok(model)
    }

    /// Parse weights from a JSON string.
    pub fn from_json(json: &str, device: Device) -> Result<Self> {
        Self::check_device(device)?;
        let file: WeightsFile = serde_json::from_str(json)
            .map_err(|e| AppError::ModelLoad(format!("malformed weights: {}", e)))?;
        let weights = Weights::try_from(file)?;
        Ok(Self {
            weights: Arc::new(weights),
            device,
            scratch: Vec::new(),
        })
    }

    fn check_device(device: Device) -> Result<()> {
        if device.is_accelerator() {
            return Err(AppError::ModelLoad(format!(
                "device {} is not available to the linear backend",
                device
            )));
        }
        Ok(())
    }

    pub fn feature_dim(&self) -> usize {
        self.weights.feature_dim
    }

    fn encoder_frames(&self, frames: usize) -> usize {
        frames.div_ceil(self.weights.subsampling_rate)
    }

    fn encode_one(&mut self, batch: &PaddedBatch, b: usize) -> Result<(EncoderOutput, LogProbMatrix)> {
        let w = Arc::clone(&self.weights);
        let length = batch.lengths[b];
        let valid = self.encoder_frames(length);
        let padded = self.encoder_frames(batch.num_frames);

        let mut hidden = Matrix::with_cols(w.hidden_dim);
        let mut ctc = Matrix::zeros(padded, w.vocab_size);
        let mut pooled = vec![0.0; w.feature_dim];
        let mut logits = Vec::with_capacity(w.vocab_size);

        for t in 0..valid {
            let start = t * w.subsampling_rate;
            let end = (start + w.subsampling_rate).min(length);
            pooled.iter_mut().for_each(|v| *v = 0.0);
            for f in start..end {
                for (p, x) in pooled.iter_mut().zip(batch.frame(b, f)) {
                    *p += x;
                }
            }
            let count = (end - start) as f32;
            pooled.iter_mut().for_each(|v| *v /= count);

            project(&pooled, &w.encoder, &mut self.scratch);
            self.scratch.iter_mut().for_each(|v| *v = v.tanh());
            hidden.push_row(&self.scratch)?;

            project(&self.scratch, &w.ctc, &mut logits);
            log_softmax_in_place(&mut logits);
            ctc.row_mut(t).copy_from_slice(&logits);
        }
        // Padding rows carry a certain blank so they are inert if read.
        for t in valid..padded {
            let row = ctc.row_mut(t);
            row.iter_mut().for_each(|v| *v = f32::NEG_INFINITY);
            row[0] = 0.0;
        }

        Ok((
            EncoderOutput {
                hidden,
                valid_frames: valid,
            },
            ctc,
        ))
    }

    fn context_vector(&self, encoder: &EncoderOutput) -> Vec<f32> {
        let mut context = vec![0.0; self.weights.hidden_dim];
        if encoder.valid_frames == 0 {
            return context;
        }
        for row in encoder.hidden.iter_rows().take(encoder.valid_frames) {
            for (c, h) in context.iter_mut().zip(row) {
                *c += h;
            }
        }
        let n = encoder.valid_frames as f32;
        context.iter_mut().for_each(|c| *c /= n);
        context
    }

    fn score_inputs(
        &mut self,
        inputs: &[TokenId],
        context: &[f32],
        projection: &Matrix,
    ) -> Result<LogProbMatrix> {
        let w = Arc::clone(&self.weights);
        let mut out = Matrix::zeros(inputs.len(), w.vocab_size);
        let mut logits = Vec::with_capacity(w.vocab_size);
        for (j, &token) in inputs.iter().enumerate() {
            if token < 0 || token as usize >= w.vocab_size {
                return Err(AppError::DecodeFailure(format!(
                    "token {} outside vocabulary of {}",
                    token, w.vocab_size
                )));
            }
            self.scratch.clear();
            self.scratch.extend(
                w.embedding
                    .row(token as usize)
                    .iter()
                    .zip(context)
                    .map(|(e, c)| (e + c).tanh()),
            );
            project(&self.scratch, projection, &mut logits);
            log_softmax_in_place(&mut logits);
            out.row_mut(j).copy_from_slice(&logits);
        }
        Ok(out)
    }
}

impl AcousticModel for LinearAcousticModel {
    fn subsampling_rate(&self) -> usize {
        self.weights.subsampling_rate
    }

    fn right_context(&self) -> usize {
        self.weights.right_context
    }

    fn start_marker_id(&self) -> TokenId {
        self.weights.sos
    }

    fn end_marker_id(&self) -> TokenId {
        self.weights.eos
    }

    fn vocab_size(&self) -> usize {
        self.weights.vocab_size
    }

    fn supports_bidirectional_decoding(&self) -> bool {
        self.weights.reverse_decoder.is_some()
    }

    fn device(&self) -> Device {
        self.device
    }

    fn forward_encoder(&mut self, batch: &PaddedBatch) -> Result<EncoderForward> {
        if batch.feature_dim != self.weights.feature_dim {
            return Err(AppError::ShapeMismatch(format!(
                "feature dim {} does not match model input dim {}",
                batch.feature_dim, self.weights.feature_dim
            )));
        }
        let mut outputs = Vec::with_capacity(batch.batch_size);
        let mut ctc_log_probs = Vec::with_capacity(batch.batch_size);
        for b in 0..batch.batch_size {
            let (output, ctc) = self.encode_one(batch, b)?;
            outputs.push(output);
            ctc_log_probs.push(ctc);
        }
        debug!(
            batch_size = batch.batch_size,
            num_frames = batch.num_frames,
            "Linear encoder forward"
        );
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
        let w = Arc::clone(&self.weights);
        let run_backward = reverse_weight > 0.0 && w.reverse_decoder.is_some();
        let mut forward = Vec::with_capacity(hyps.num_hypotheses());
        let mut backward = Vec::with_capacity(if run_backward { hyps.num_hypotheses() } else { 0 });

        for i in 0..hyps.num_hypotheses() {
            let owner = hyps.owners[i];
            let encoder = encoders.get(owner).ok_or_else(|| {
                AppError::DecodeFailure(format!("hypothesis {} has no encoder output {}", i, owner))
            })?;
            let context = self.context_vector(encoder);
            let row = hyps.row(i);
            forward.push(self.score_inputs(row, &context, &w.decoder)?);

            if let (true, Some(reverse)) = (run_backward, w.reverse_decoder.as_ref()) {
                let len = hyps.lengths[i];
                let mut reversed = Vec::with_capacity(hyps.max_len);
                reversed.push(w.sos);
                reversed.extend(row[1..len].iter().rev());
                reversed.resize(hyps.max_len, w.eos);
                backward.push(self.score_inputs(&reversed, &context, reverse)?);
            }
        }

        Ok(DecoderOutput {
            forward,
            backward: run_backward.then_some(backward),
        })
    }

    fn fork(&self) -> Box<dyn AcousticModel> {
        Box::new(Self {
            weights: Arc::clone(&self.weights),
            device: self.device,
            scratch: Vec::new(),
        })
    }

    fn release_transient_buffers(&mut self) {
        self.scratch = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchedFeatures;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn weights_json(bidirectional: bool) -> String {
        let mut value = json!({
            "feature_dim": 2,
            "hidden_dim": 2,
            "vocab_size": 4,
            "subsampling_rate": 2,
            "encoder": [[1.0, 0.0], [0.0, 1.0]],
            "ctc": [[0.5, 1.0, -1.0, 0.0], [0.2, -0.3, 1.0, 0.0]],
            "embedding": [[0.1, 0.2], [0.3, -0.1], [-0.2, 0.4], [0.0, 0.0]],
            "decoder": [[1.0, 0.5, -0.5, 0.2], [-0.3, 0.8, 0.1, 0.4]],
        });
        if bidirectional {
            value["reverse_decoder"] = json!([[0.4, -0.2, 0.6, 0.1], [0.2, 0.3, -0.7, 0.5]]);
        }
        value.to_string()
    }

    fn features(frames: usize) -> Matrix {
        Matrix::from_rows((0..frames).map(|i| vec![i as f32 * 0.1, 1.0 - i as f32 * 0.1]).collect())
            .unwrap()
    }

    #[test]
    fn test_encoder_subsamples_and_normalizes() {
        let mut model = LinearAcousticModel::from_json(&weights_json(false), Device::Cpu).unwrap();
        let batch = BatchedFeatures::new(vec![features(5), features(2)]).pad().unwrap();
        let out = model.forward_encoder(&batch).unwrap();

        assert_eq!(out.outputs[0].valid_frames, 3);
        assert_eq!(out.outputs[1].valid_frames, 1);
        assert_eq!(out.ctc_log_probs[0].rows(), 3);
        assert_eq!(out.ctc_log_probs[1].rows(), 3);
        for row in out.ctc_log_probs[0].iter_rows() {
            let total: f32 = row.iter().map(|v| v.exp()).sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_encoder_rejects_wrong_feature_dim() {
        let mut model = LinearAcousticModel::from_json(&weights_json(false), Device::Cpu).unwrap();
        let feats = Matrix::from_rows(vec![vec![0.0, 0.0, 0.0]]).unwrap();
        let batch = BatchedFeatures::new(vec![feats]).pad().unwrap();
        assert!(matches!(
            model.forward_encoder(&batch),
            Err(AppError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_decoder_directions() {
        let mut model = LinearAcousticModel::from_json(&weights_json(true), Device::Cpu).unwrap();
        assert!(model.supports_bidirectional_decoding());
        let batch = BatchedFeatures::new(vec![features(4)]).pad().unwrap();
        let enc = model.forward_encoder(&batch).unwrap();
        let hyps = PaddedHypotheses {
            tokens: vec![3, 1, 2, 3, 3, 2, 3, 3],
            lengths: vec![3, 2],
            max_len: 4,
            owners: vec![0, 0],
        };
        let encoders = vec![&enc.outputs[0]];

        let out = model.forward_decoder(&encoders, &hyps, 0.0).unwrap();
        assert_eq!(out.forward.len(), 2);
        assert_eq!(out.forward[0].rows(), 4);
        assert_eq!(out.forward[0].cols(), 4);
        assert!(out.backward.is_none());

        let out = model.forward_decoder(&encoders, &hyps, 0.3).unwrap();
        assert_eq!(out.backward.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_fork_shares_weights_and_matches_outputs() {
        let mut model = LinearAcousticModel::from_json(&weights_json(false), Device::Cpu).unwrap();
        let mut fork = model.fork();
        let batch = BatchedFeatures::new(vec![features(3)]).pad().unwrap();
        let a = model.forward_encoder(&batch).unwrap();
        let b = fork.forward_encoder(&batch).unwrap();
        assert_eq!(a.outputs, b.outputs);
        assert_eq!(a.ctc_log_probs, b.ctc_log_probs);
    }

    #[test]
    fn test_load_from_file_and_failures() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(weights_json(false).as_bytes()).unwrap();

        let model = LinearAcousticModel::load(file.path(), Device::Cpu).unwrap();
        assert_eq!(model.end_marker_id(), 3);
        assert_eq!(model.info().device, "cpu");

        assert!(matches!(
            LinearAcousticModel::load(file.path(), Device::Cuda(0)),
            Err(AppError::ModelLoad(_))
        ));
        assert!(matches!(
            LinearAcousticModel::load("/nonexistent/weights.json", Device::Cpu),
            Err(AppError::ModelLoad(_))
        ));

        let bad = weights_json(false).replace("\"hidden_dim\":2", "\"hidden_dim\":3");
        assert!(matches!(
            LinearAcousticModel::from_json(&bad, Device::Cpu),
            Err(AppError::ModelLoad(_))
        ));
    }
}
