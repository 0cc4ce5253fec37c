//! Acoustic model contract and the tensor-like containers passed across it.
//!
//! The numeric forward pass lives behind [`AcousticModel`]. Everything in this
//! module is plain data: row-major matrices, padded batches and the opaque
//! per-utterance encoder buffers that later feed attention rescoring.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{AppError, Result};

pub mod linear;
#[cfg(test)]
pub(crate) mod testing;

pub use linear::LinearAcousticModel;

/// Vocabulary token identifier as produced by the CTC head and consumed by the decoder.
pub type TokenId = i32;

/// Dense row-major `f32` matrix.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

/// Ordered feature vectors of one utterance (frames x feature dim).
pub type FeatureSequence = Matrix;

/// Per-frame (or per-position) log-probabilities over the vocabulary.
pub type LogProbMatrix = Matrix;

impl Matrix {
    /// Wrap `data` as a `rows x cols` matrix.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(AppError::ShapeMismatch(format!(
                "matrix data has {} values, expected {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// A `rows x cols` matrix of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// An empty matrix that accepts rows of width `cols`.
    pub fn with_cols(cols: usize) -> Self {
        Self {
            rows: 0,
            cols,
            data: Vec::new(),
        }
    }

    /// Build a matrix from equally sized rows.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut matrix = Self::with_cols(cols);
        for row in &rows {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Borrow row `r`. Panics if `r` is out of range.
    pub fn row(&self, r: usize) -> &[f32] {
        let start = r * self.cols;
        &self.data[start..start + self.cols]
    }

    /// Value at (`r`, `c`). Panics if either index is out of range.
    pub fn get(&self, r: usize, c: usize) -> f32 {
        assert!(c < self.cols, "column {} out of range ({})", c, self.cols);
        self.data[r * self.cols + c]
    }

    /// Mutably borrow row `r`. Panics if `r` is out of range.
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        let start = r * self.cols;
        &mut self.data[start..start + self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> + '_ {
        (0..self.rows).map(move |r| self.row(r))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Append one row, fixing the width on the first push into a 0x0 matrix.
    pub fn push_row(&mut self, row: &[f32]) -> Result<()> {
        if self.rows == 0 && self.cols == 0 {
            self.cols = row.len();
        }
        if row.len() != self.cols {
            return Err(AppError::ShapeMismatch(format!(
                "row has {} values, expected {}",
                row.len(),
                self.cols
            )));
        }
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    /// Append all rows of `other`.
    pub fn append(&mut self, other: &Matrix) -> Result<()> {
        for row in other.iter_rows() {
            self.push_row(row)?;
        }
        Ok(())
    }

    /// Keep at most the first `rows` rows.
    pub fn truncate_rows(&mut self, rows: usize) {
        if rows < self.rows {
            self.rows = rows;
            self.data.truncate(rows * self.cols);
        }
    }

    /// Copy rows `[start, end)` into a new matrix.
    pub fn slice_rows(&self, start: usize, end: usize) -> Matrix {
        let end = end.min(self.rows);
        let start = start.min(end);
        Matrix {
            rows: end - start,
            cols: self.cols,
            data: self.data[start * self.cols..end * self.cols].to_vec(),
        }
    }

    /// Drop every row, keeping the width.
    pub fn clear(&mut self) {
        self.rows = 0;
        self.data.clear();
    }
}

/// A set of utterances to push through the encoder in one call.
#[derive(Debug, Clone, Default)]
pub struct BatchedFeatures {
    sequences: Vec<FeatureSequence>,
}

impl BatchedFeatures {
    pub fn new(sequences: Vec<FeatureSequence>) -> Self {
        Self { sequences }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// True frame count of every utterance.
    pub fn lengths(&self) -> Vec<usize> {
        self.sequences.iter().map(Matrix::rows).collect()
    }

    /// The common feature dimension, or `ShapeMismatch` if utterances disagree.
    pub fn feature_dim(&self) -> Result<usize> {
        let first = self
            .sequences
            .first()
            .ok_or_else(|| AppError::ShapeMismatch("empty feature batch".to_string()))?;
        let dim = first.cols();
        for (i, seq) in self.sequences.iter().enumerate().skip(1) {
            if seq.cols() != dim {
                return Err(AppError::ShapeMismatch(format!(
                    "utterance {} has feature dim {}, expected {}",
                    i,
                    seq.cols(),
                    dim
                )));
            }
        }
        Ok(dim)
    }

    /// Zero-pad every utterance to the longest frame count.
    pub fn pad(&self) -> Result<PaddedBatch> {
        let feature_dim = self.feature_dim()?;
        let lengths = self.lengths();
        let num_frames = lengths.iter().copied().max().unwrap_or(0);
        let mut data = vec![0.0; self.sequences.len() * num_frames * feature_dim];
        for (b, seq) in self.sequences.iter().enumerate() {
            let offset = b * num_frames * feature_dim;
            data[offset..offset + seq.as_slice().len()].copy_from_slice(seq.as_slice());
        }
        Ok(PaddedBatch {
            batch_size: self.sequences.len(),
            num_frames,
            feature_dim,
            data,
            lengths,
        })
    }
}

/// Features laid out as `batch x frames x dim`; frames past `lengths[b]` are zero.
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    pub batch_size: usize,
    pub num_frames: usize,
    pub feature_dim: usize,
    pub data: Vec<f32>,
    pub lengths: Vec<usize>,
}

impl PaddedBatch {
    pub fn frame(&self, b: usize, t: usize) -> &[f32] {
        let start = (b * self.num_frames + t) * self.feature_dim;
        &self.data[start..start + self.feature_dim]
    }
}

/// Encoder activations for one utterance (frames x hidden dim).
///
/// Produced once per utterance and owned by the engine clone of the session
/// that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOutput {
    pub hidden: Matrix,
    /// Valid (non-padded) frame count.
    pub valid_frames: usize,
}

impl EncoderOutput {
    pub fn hidden_dim(&self) -> usize {
        self.hidden.cols()
    }
}

/// Result of one batched encoder call.
#[derive(Debug, Clone)]
pub struct EncoderForward {
    pub outputs: Vec<EncoderOutput>,
    /// One matrix per utterance; rows past the utterance's valid length are padding.
    pub ctc_log_probs: Vec<LogProbMatrix>,
}

/// Start-marker-prefixed hypotheses padded to a common length.
#[derive(Debug, Clone)]
pub struct PaddedHypotheses {
    /// `num_hypotheses x max_len` token ids, padded with the end marker.
    pub tokens: Vec<TokenId>,
    /// Length of each row including the start marker.
    pub lengths: Vec<usize>,
    pub max_len: usize,
    /// Index into the encoder-output slice for each hypothesis.
    pub owners: Vec<usize>,
}

impl PaddedHypotheses {
    pub fn num_hypotheses(&self) -> usize {
        self.lengths.len()
    }

    pub fn row(&self, i: usize) -> &[TokenId] {
        &self.tokens[i * self.max_len..(i + 1) * self.max_len]
    }
}

/// Decoder log-probabilities, one `max_len x vocab` matrix per hypothesis.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    pub forward: Vec<LogProbMatrix>,
    /// Right-to-left scores, present only when the model has a backward decoder
    /// and a positive reverse weight was requested.
    pub backward: Option<Vec<LogProbMatrix>>,
}

/// Compute device resolved once at model load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Whether transient device buffers must be released after each call.
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl FromStr for Device {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            _ => s
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| AppError::Configuration(format!("unknown device '{}'", s))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
        }
    }
}

/// Static description of a loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub subsampling_rate: usize,
    pub right_context: usize,
    pub start_marker_id: TokenId,
    pub end_marker_id: TokenId,
    pub bidirectional_decoder: bool,
    pub vocab_size: usize,
    pub device: String,
}

/// The neural acoustic model: an encoder with a CTC head plus an attention decoder.
///
/// Implementations keep their weights behind shared, read-only storage. [`fork`]
/// returns a cheap clone that reuses those weights but owns its own mutable
/// inference state, so each session can run on its own fork without locking.
///
/// [`fork`]: AcousticModel::fork
pub trait AcousticModel: Send + Sync {
    fn subsampling_rate(&self) -> usize;

    fn right_context(&self) -> usize;

    fn start_marker_id(&self) -> TokenId;

    fn end_marker_id(&self) -> TokenId;

    fn vocab_size(&self) -> usize;

    fn supports_bidirectional_decoding(&self) -> bool;

    fn device(&self) -> Device;

    /// Run the encoder over a padded batch.
    fn forward_encoder(&mut self, batch: &PaddedBatch) -> Result<EncoderForward>;

    /// Score padded hypotheses against the encoder outputs they belong to.
    ///
    /// `encoders[hyps.owners[i]]` is the encoder output for hypothesis `i`.
    fn forward_decoder(
        &mut self,
        encoders: &[&EncoderOutput],
        hyps: &PaddedHypotheses,
        reverse_weight: f32,
    ) -> Result<DecoderOutput>;

    /// Clone sharing weights, with fresh per-call state.
    fn fork(&self) -> Box<dyn AcousticModel>;

    /// Release transient accelerator buffers held after a call.
    fn release_transient_buffers(&mut self) {}

    fn info(&self) -> ModelInfo {
        ModelInfo {
            subsampling_rate: self.subsampling_rate(),
            right_context: self.right_context(),
            start_marker_id: self.start_marker_id(),
            end_marker_id: self.end_marker_id(),
            bidirectional_decoder: self.supports_bidirectional_decoding(),
            vocab_size: self.vocab_size(),
            device: self.device().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_push_and_slice() {
        let mut m = Matrix::with_cols(2);
        m.push_row(&[1.0, 2.0]).unwrap();
        m.push_row(&[3.0, 4.0]).unwrap();
        m.push_row(&[5.0, 6.0]).unwrap();
        assert_eq!(m.rows(), 3);
        assert_eq!(m.get(1, 1), 4.0);

        let tail = m.slice_rows(1, 10);
        assert_eq!(tail.rows(), 2);
        assert_eq!(tail.row(0), &[3.0, 4.0]);

        assert!(m.push_row(&[1.0]).is_err());
    }

    #[test]
    fn test_pad_zero_fills_short_utterances() {
        let a = Matrix::from_rows(vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]]).unwrap();
        let b = Matrix::from_rows(vec![vec![9.0, 9.0]]).unwrap();
        let padded = BatchedFeatures::new(vec![a, b]).pad().unwrap();

        assert_eq!(padded.num_frames, 3);
        assert_eq!(padded.lengths, vec![3, 1]);
        assert_eq!(padded.frame(1, 0), &[9.0, 9.0]);
        assert_eq!(padded.frame(1, 2), &[0.0, 0.0]);
    }

    #[test]
    fn test_pad_rejects_mixed_feature_dims() {
        let a = Matrix::from_rows(vec![vec![1.0, 1.0]]).unwrap();
        let b = Matrix::from_rows(vec![vec![1.0, 1.0, 1.0]]).unwrap();
        let err = BatchedFeatures::new(vec![a, b]).pad().unwrap_err();
        assert!(matches!(err, AppError::ShapeMismatch(_)));

        let err = BatchedFeatures::default().pad().unwrap_err();
        assert!(matches!(err, AppError::ShapeMismatch(_)));
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("tpu".parse::<Device>().is_err());
        assert!(Device::Cuda(1).is_accelerator());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }
}
