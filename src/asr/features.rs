//! Audio front end.
//!
//! This module converts 16-bit PCM into float samples and frames the samples
//! into log band-energy feature vectors. The decoder only depends on the
//! [`FeatureExtractor`] trait; [`FbankExtractor`] is the built-in implementation.

use std::f32::consts::PI;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::model::{FeatureSequence, Matrix};

/// Convert raw audio bytes (16-bit PCM) to floating point samples.
///
/// # Arguments
/// * `audio_bytes` - Raw audio bytes in 16-bit little-endian PCM format
///
/// # Returns
/// Vector of f32 samples normalized to [-1.0, 1.0], or `InvalidInput` if the
/// byte count is odd
pub fn bytes_to_f32_samples(audio_bytes: &[u8]) -> Result<Vec<f32>> {
    if audio_bytes.len() % 2 != 0 {
        return Err(AppError::InvalidInput(format!(
            "PCM16 payload has odd length {}",
            audio_bytes.len()
        )));
    }
    Ok(audio_bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub sample_rate: u32,
    pub num_bins: usize,
    pub frame_length_ms: u32,
    pub frame_shift_ms: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            num_bins: 80,
            frame_length_ms: 25,
            frame_shift_ms: 10,
        }
    }
}

impl FeatureConfig {
    /// Window length in samples.
    pub fn frame_length(&self) -> usize {
        (self.sample_rate as usize * self.frame_length_ms as usize) / 1000
    }

    /// Hop size in samples.
    pub fn frame_shift(&self) -> usize {
        (self.sample_rate as usize * self.frame_shift_ms as usize) / 1000
    }
}

/// Streaming feature extraction for one utterance at a time.
pub trait FeatureExtractor: Send {
    fn feature_dim(&self) -> usize;

    /// Append samples in [-1.0, 1.0].
    fn accept_waveform(&mut self, samples: &[f32]) -> Result<()>;

    /// Remove and return every complete frame computed so far.
    fn take_frames(&mut self) -> FeatureSequence;

    /// No more audio follows for this utterance.
    fn set_input_finished(&mut self);

    fn reset(&mut self);
}

/// Creates one extractor per session.
pub type FeatureExtractorFactory = Arc<dyn Fn() -> Box<dyn FeatureExtractor> + Send + Sync>;

pub fn fbank_factory(config: FeatureConfig) -> FeatureExtractorFactory {
    Arc::new(move || Box::new(FbankExtractor::new(config.clone())) as Box<dyn FeatureExtractor>)
}

const PREEMPHASIS: f32 = 0.97;
const LOW_FREQ_HZ: f32 = 20.0;
const ENERGY_FLOOR: f32 = 1e-10;

fn mel(hz: f32) -> f32 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

fn inverse_mel(mel: f32) -> f32 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

/// Log energies at mel-spaced frequencies, computed per window with the
/// Goertzel recurrence. Incomplete trailing windows are dropped.
#[derive(Debug, Clone)]
pub struct FbankExtractor {
    config: FeatureConfig,
    window: Vec<f32>,
    /// Goertzel coefficient `2 cos(w)` per band.
    coefficients: Vec<f32>,
    pending: Vec<f32>,
    ready: Matrix,
    frame: Vec<f32>,
    input_finished: bool,
}

impl FbankExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        let length = config.frame_length().max(1);
        let window = (0..length)
            .map(|n| {
                if length == 1 {
                    1.0
                } else {
                    0.54 - 0.46 * (2.0 * PI * n as f32 / (length - 1) as f32).cos()
                }
            })
            .collect();

        let nyquist = config.sample_rate as f32 / 2.0;
        let (low, high) = (mel(LOW_FREQ_HZ), mel(nyquist));
        let step = (high - low) / (config.num_bins + 1) as f32;
        let coefficients = (1..=config.num_bins)
            .map(|i| {
                let hz = inverse_mel(low + step * i as f32);
                2.0 * (2.0 * PI * hz / config.sample_rate as f32).cos()
            })
            .collect();

        Self {
            ready: Matrix::with_cols(config.num_bins),
            config,
            window,
            coefficients,
            pending: Vec::new(),
            frame: Vec::new(),
            input_finished: false,
        }
    }

    fn compute_frame(&mut self) -> Vec<f32> {
        let length = self.window.len();
        self.frame.clear();
        self.frame
            .extend(self.pending[..length].iter().map(|s| s * 32768.0));

        let mean = self.frame.iter().sum::<f32>() / length as f32;
        self.frame.iter_mut().for_each(|s| *s -= mean);
        for i in (1..length).rev() {
            self.frame[i] -= PREEMPHASIS * self.frame[i - 1];
        }
        self.frame[0] -= PREEMPHASIS * self.frame[0];
        for (s, w) in self.frame.iter_mut().zip(&self.window) {
            *s *= w;
        }

        self.coefficients
            .iter()
            .map(|&coeff| {
                let (mut prev, mut prev2) = (0.0f32, 0.0f32);
                for &x in &self.frame {
                    let s = x + coeff * prev - prev2;
                    prev2 = prev;
                    prev = s;
                }
                let power = prev * prev + prev2 * prev2 - coeff * prev * prev2;
                power.max(ENERGY_FLOOR).ln()
            })
            .collect()
    }
}

impl FeatureExtractor for FbankExtractor {
    fn feature_dim(&self) -> usize {
        self.config.num_bins
    }

    fn accept_waveform(&mut self, samples: &[f32]) -> Result<()> {
        if self.input_finished {
            return Ok(());
        }
        self.pending.extend_from_slice(samples);
        let length = self.window.len();
        let shift = self.config.frame_shift().max(1);
        while self.pending.len() >= length {
            let features = self.compute_frame();
            self.ready.push_row(&features)?;
            self.pending.drain(..shift.min(self.pending.len()));
        }
        Ok(())
    }

    fn take_frames(&mut self) -> FeatureSequence {
        std::mem::replace(&mut self.ready, Matrix::with_cols(self.config.num_bins))
    }

    fn set_input_finished(&mut self) {
        self.input_finished = true;
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.ready.clear();
        self.input_finished = false;
    }
}
