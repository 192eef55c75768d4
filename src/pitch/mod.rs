pub mod note;

use log::trace;
use thiserror::Error;

use crate::config::Config;

pub use note::{
    cents_between, frequency_to_note, note_frequency, target_frequency, Note, PitchClass,
};

/// Reasons a single frame could not be analysed
///
/// These are per-frame conditions; the capture loop treats every one of them
/// as "no pitch this frame".
#[derive(Debug, Error, PartialEq)]
pub enum EstimateError {
    #[error("empty audio frame")]
    EmptyFrame,

    #[error("audio frame contains non-finite samples")]
    NonFiniteSample,

    #[error("sample rate {sample_rate} Hz is too low to resolve {max_frequency} Hz")]
    SampleRateTooLow { sample_rate: f32, max_frequency: f32 },
}

/// Monophonic pitch estimator using the YIN algorithm
///
/// Incoming frames are hops: they are appended to an overlapping analysis
/// window and the estimate is computed over the most recent `window_size`
/// samples.
pub struct PitchEstimator {
    sample_rate: f32,
    window_size: usize,
    threshold: f32,
    silence_db: f32,
    min_frequency: f32,
    max_frequency: f32,
    window: Vec<f32>,
}

impl PitchEstimator {
    pub fn new(sample_rate: u32, window_size: usize, threshold: f32) -> Self {
        Self {
            sample_rate: sample_rate as f32,
            window_size,
            threshold,
            silence_db: -40.0,
            min_frequency: 60.0,
            max_frequency: 1600.0,
            window: Vec::with_capacity(window_size),
        }
    }

    /// Build an estimator from config for a stream running at `sample_rate`
    pub fn from_config(config: &Config, sample_rate: u32) -> Self {
        Self::new(sample_rate, config.window_size, config.pitch_threshold)
            .with_silence_db(config.silence_db)
            .with_range(config.min_frequency, config.max_frequency)
    }

    pub fn with_silence_db(mut self, silence_db: f32) -> Self {
        self.silence_db = silence_db;
        self
    }

    pub fn with_range(mut self, min_frequency: f32, max_frequency: f32) -> Self {
        self.min_frequency = min_frequency;
        self.max_frequency = max_frequency;
        self
    }

    /// Discard buffered audio
    pub fn reset(&mut self) {
        self.window.clear();
    }

    /// Feed one frame and estimate the fundamental frequency
    ///
    /// `Ok(None)` means silence or no voiced pitch.
    pub fn estimate(&mut self, frame: &[f32]) -> Result<Option<f32>, EstimateError> {
        if frame.is_empty() {
            return Err(EstimateError::EmptyFrame);
        }
        if frame.iter().any(|s| !s.is_finite()) {
            return Err(EstimateError::NonFiniteSample);
        }
        if self.sample_rate < self.max_frequency * 2.0 {
            return Err(EstimateError::SampleRateTooLow {
                sample_rate: self.sample_rate,
                max_frequency: self.max_frequency,
            });
        }

        self.push(frame);

        // Gate on the newest hop so a note that just stopped reads as silence
        let level = level_db(frame);
        if level < self.silence_db {
            trace!("Frame below silence gate: {:.1} dB", level);
            return Ok(None);
        }

        if self.window.len() < self.window_size / 2 {
            return Ok(None);
        }

        Ok(self.yin(&self.window))
    }

    fn push(&mut self, frame: &[f32]) {
        if frame.len() >= self.window_size {
            self.window.clear();
            self.window
                .extend_from_slice(&frame[frame.len() - self.window_size..]);
            return;
        }
        let overflow = (self.window.len() + frame.len()).saturating_sub(self.window_size);
        if overflow > 0 {
            self.window.drain(..overflow);
        }
        self.window.extend_from_slice(frame);
    }

    fn yin(&self, samples: &[f32]) -> Option<f32> {
        let min_period = ((self.sample_rate / self.max_frequency) as usize).max(2);
        let max_period = ((self.sample_rate / self.min_frequency) as usize).min(samples.len() / 2);
        if max_period <= min_period {
            return None;
        }
        let integration = samples.len() - max_period;

        // Difference function
        let mut diff = vec![0.0_f32; max_period + 1];
        for (tau, d) in diff.iter_mut().enumerate().skip(1) {
            let mut sum = 0.0;
            for i in 0..integration {
                let delta = samples[i] - samples[i + tau];
                sum += delta * delta;
            }
            *d = sum;
        }

        // Cumulative mean normalized difference
        let mut cmnd = vec![1.0_f32; max_period + 1];
        let mut running_sum = 0.0;
        for tau in 1..=max_period {
            running_sum += diff[tau];
            cmnd[tau] = if running_sum == 0.0 {
                1.0
            } else {
                diff[tau] * tau as f32 / running_sum
            };
        }

        // First minimum below threshold
        let mut tau = min_period;
        while tau < max_period {
            if cmnd[tau] < self.threshold {
                while tau + 1 < max_period && cmnd[tau + 1] < cmnd[tau] {
                    tau += 1;
                }
                break;
            }
            tau += 1;
        }
        if tau >= max_period {
            return None;
        }

        let better_tau = parabolic_interpolation(&cmnd, tau);
        let frequency = self.sample_rate / better_tau;

        if (self.min_frequency..=self.max_frequency).contains(&frequency) {
            trace!(
                "Estimated {:.2} Hz (cmnd {:.3})",
                frequency,
                cmnd[tau]
            );
            Some(frequency)
        } else {
            None
        }
    }
}

/// Parabolic interpolation for sub-sample accuracy
fn parabolic_interpolation(data: &[f32], index: usize) -> f32 {
    if index == 0 || index >= data.len() - 1 {
        return index as f32;
    }

    let s0 = data[index - 1];
    let s1 = data[index];
    let s2 = data[index + 1];

    let denom = s0 - 2.0 * s1 + s2;
    if denom.abs() < f32::EPSILON {
        return index as f32;
    }
    index as f32 + 0.5 * (s0 - s2) / denom
}

/// RMS level of a frame in dBFS
pub fn level_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    10.0 * mean_square.log10()
}
