//! Noise suppression and voice activity detection
//!
//! Operates on 10 ms frames at 48 kHz. The actual denoising sits behind the
//! [`Denoiser`] capability so an external neural denoiser can be slotted in;
//! the shipped implementation combines a level-dependent noise gate with an
//! RMS/zero-crossing speech probability estimate.

use std::collections::VecDeque;

use crate::constants::DENOISE_FRAME_SIZE;
use crate::error::AudioError;

/// Root-mean-square level of a normalized sample block
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Fraction of adjacent sample pairs that change sign
pub fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f32 / (samples.len() - 1) as f32
}

pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        return -100.0;
    }
    20.0 * linear.log10()
}

pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Per-frame denoise capability
///
/// `process_frame` denoises in place and returns the speech probability for
/// the frame in [0, 1].
pub trait Denoiser: Send {
    fn process_frame(&mut self, frame: &mut [f32]) -> f32;

    /// Suppression strength hint in [0, 1]; implementations may ignore it
    fn set_suppression_level(&mut self, _level: f32) {}
}

/// Shipped denoiser: noise gate plus RMS/zero-crossing speech estimate
pub struct GateDenoiser {
    suppression_level: f32,
}

impl GateDenoiser {
    pub fn new(suppression_level: f32) -> Self {
        Self {
            suppression_level: suppression_level.clamp(0.0, 1.0),
        }
    }

    fn speech_probability(frame: &[f32]) -> f32 {
        let level = rms(frame);
        let zcr = zero_crossing_rate(frame);

        // Speech carries energy and a moderate crossing rate; pure tones
        // and hiss land at the extremes.
        let rms_score = (level * 5.0).min(1.0);
        let zcr_score = 1.0 - ((zcr - 0.15).abs() / 0.35).min(1.0);

        (0.6 * rms_score + 0.4 * zcr_score).clamp(0.0, 1.0)
    }
}

impl Denoiser for GateDenoiser {
    fn process_frame(&mut self, frame: &mut [f32]) -> f32 {
        let probability = Self::speech_probability(frame);

        let gate_threshold = 0.01 * (1.0 - self.suppression_level);
        let attenuation = 1.0 - self.suppression_level;
        for sample in frame.iter_mut() {
            if sample.abs() < gate_threshold {
                *sample *= attenuation;
            }
        }

        probability
    }

    fn set_suppression_level(&mut self, level: f32) {
        self.suppression_level = level.clamp(0.0, 1.0);
    }
}

/// Snapshot of the suppressor state
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseMetrics {
    /// Instantaneous noise estimate in [0, 1]
    pub noise_level: f32,
    /// Most recent speech probability in [0, 1]
    pub speech_probability: f32,
    /// Suppression applied to the last frame in [0, 1]
    pub suppression: f32,
    pub processed_frames: u64,
}

const HISTORY_LEN: usize = 100;

/// VAD attenuation for sub-threshold frames; a fixed factor instead of a
/// hard mute avoids audible gate clicks
const VAD_ATTENUATION: f32 = 0.1;

pub struct NoiseSuppressor {
    denoiser: Box<dyn Denoiser>,
    suppression_level: f32,
    threshold: f32,
    vad_enabled: bool,
    adaptive_enabled: bool,
    metrics: NoiseMetrics,
    noise_history: VecDeque<f32>,
    speech_history: VecDeque<f32>,
}

impl NoiseSuppressor {
    /// The denoiser is trained for 48 kHz; other rates are rejected
    pub fn new(sample_rate: u32) -> Result<Self, AudioError> {
        if sample_rate != crate::constants::SAMPLE_RATE {
            return Err(AudioError::UnsupportedSampleRate(sample_rate));
        }

        let suppression_level = 0.8;
        Ok(Self {
            denoiser: Box::new(GateDenoiser::new(suppression_level)),
            suppression_level,
            threshold: 0.5,
            vad_enabled: true,
            adaptive_enabled: true,
            metrics: NoiseMetrics::default(),
            noise_history: VecDeque::with_capacity(HISTORY_LEN),
            speech_history: VecDeque::with_capacity(HISTORY_LEN),
        })
    }

    /// Denoise one 10 ms frame in place and update the speech estimate
    pub fn process(&mut self, frame: &mut [f32]) -> Result<(), AudioError> {
        if frame.len() != DENOISE_FRAME_SIZE {
            return Err(AudioError::UnsupportedFormat(format!(
                "denoise frame must be {DENOISE_FRAME_SIZE} samples, got {}",
                frame.len()
            )));
        }

        let probability = self.denoiser.process_frame(frame);
        let noise_level = (rms(frame) * 10.0).min(1.0);
        let suppression = self.suppression_level * noise_level;

        self.metrics = NoiseMetrics {
            noise_level,
            speech_probability: probability,
            suppression,
            processed_frames: self.metrics.processed_frames + 1,
        };
        self.push_history(noise_level, probability);

        if self.vad_enabled && probability < self.threshold {
            for sample in frame.iter_mut() {
                *sample *= VAD_ATTENUATION;
            }
        }

        if self.adaptive_enabled {
            self.apply_adaptive_suppression(frame, noise_level);
        }

        for sample in frame.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        Ok(())
    }

    /// Extra attenuation when the noise estimate runs well above its mean
    fn apply_adaptive_suppression(&mut self, frame: &mut [f32], current_noise: f32) {
        let average = self.average_noise_level();
        if average <= 0.0 || current_noise <= average * 1.5 {
            return;
        }
        let extra = ((current_noise - average) / average).min(0.5);
        for sample in frame.iter_mut() {
            *sample *= 1.0 - extra;
        }
    }

    fn push_history(&mut self, noise_level: f32, probability: f32) {
        if self.noise_history.len() >= HISTORY_LEN {
            self.noise_history.pop_front();
        }
        if self.speech_history.len() >= HISTORY_LEN {
            self.speech_history.pop_front();
        }
        self.noise_history.push_back(noise_level);
        self.speech_history.push_back(probability);
    }

    pub fn set_suppression_level(&mut self, level: f32) {
        self.suppression_level = level.clamp(0.0, 1.0);
        self.denoiser.set_suppression_level(self.suppression_level);
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn enable_vad(&mut self, enable: bool) {
        self.vad_enabled = enable;
    }

    pub fn enable_adaptive(&mut self, enable: bool) {
        self.adaptive_enabled = enable;
    }

    pub fn metrics(&self) -> NoiseMetrics {
        self.metrics
    }

    /// Most recent speech probability above the configured gate
    pub fn is_speech(&self) -> bool {
        self.metrics.speech_probability > self.threshold
    }

    pub fn speech_probability(&self) -> f32 {
        self.metrics.speech_probability
    }

    pub fn average_noise_level(&self) -> f32 {
        if self.noise_history.is_empty() {
            return 0.0;
        }
        self.noise_history.iter().sum::<f32>() / self.noise_history.len() as f32
    }

    pub fn average_speech_probability(&self) -> f32 {
        if self.speech_history.is_empty() {
            return 0.0;
        }
        self.speech_history.iter().sum::<f32>() / self.speech_history.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame(freq: f32, amplitude: f32) -> Vec<f32> {
        (0..DENOISE_FRAME_SIZE)
            .map(|i| {
                let t = i as f32 / crate::constants::SAMPLE_RATE as f32;
                (t * freq * 2.0 * std::f32::consts::PI).sin() * amplitude
            })
            .collect()
    }

    #[test]
    fn rejects_wrong_sample_rate() {
        assert!(NoiseSuppressor::new(44_100).is_err());
        assert!(NoiseSuppressor::new(48_000).is_ok());
    }

    #[test]
    fn rejects_wrong_frame_length() {
        let mut suppressor = NoiseSuppressor::new(48_000).unwrap();
        let mut frame = vec![0.0f32; 960];
        assert!(suppressor.process(&mut frame).is_err());
    }

    #[test]
    fn silence_is_not_speech() {
        let mut suppressor = NoiseSuppressor::new(48_000).unwrap();
        let mut frame = vec![0.0f32; DENOISE_FRAME_SIZE];
        suppressor.process(&mut frame).unwrap();
        assert!(!suppressor.is_speech());
        assert!(frame.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn voiced_signal_is_speech() {
        let mut suppressor = NoiseSuppressor::new(48_000).unwrap();
        let mut frame = sine_frame(440.0, 0.5);
        suppressor.process(&mut frame).unwrap();
        assert!(suppressor.is_speech());
        assert!(suppressor.speech_probability() > 0.5);
    }

    #[test]
    fn vad_attenuates_quiet_frames() {
        let mut suppressor = NoiseSuppressor::new(48_000).unwrap();
        suppressor.enable_adaptive(false);
        // Quiet enough to fall under the speech gate but over the noise gate.
        let mut frame = sine_frame(3000.0, 0.02);
        let before = rms(&frame);
        suppressor.process(&mut frame).unwrap();
        let after = rms(&frame);
        assert!(!suppressor.is_speech());
        assert!(after < before * 0.2, "expected VAD attenuation, {before} -> {after}");
    }

    #[test]
    fn vad_disabled_leaves_level() {
        let mut suppressor = NoiseSuppressor::new(48_000).unwrap();
        suppressor.enable_vad(false);
        suppressor.enable_adaptive(false);
        let mut frame = sine_frame(3000.0, 0.02);
        let before = rms(&frame);
        suppressor.process(&mut frame).unwrap();
        assert!(rms(&frame) > before * 0.5);
    }

    #[test]
    fn adaptive_reacts_to_noise_spike() {
        let mut suppressor = NoiseSuppressor::new(48_000).unwrap();
        suppressor.enable_vad(false);
        // Establish a quiet noise floor.
        for _ in 0..20 {
            let mut quiet = sine_frame(1000.0, 0.02);
            suppressor.process(&mut quiet).unwrap();
        }
        let mut spike = sine_frame(1000.0, 0.9);
        let before = rms(&spike);
        suppressor.process(&mut spike).unwrap();
        assert!(rms(&spike) < before, "spike should be attenuated");
    }

    #[test]
    fn output_stays_in_range() {
        let mut suppressor = NoiseSuppressor::new(48_000).unwrap();
        let mut frame = vec![1.5f32; DENOISE_FRAME_SIZE];
        suppressor.process(&mut frame).unwrap();
        assert!(frame.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[test]
    fn histories_are_bounded() {
        let mut suppressor = NoiseSuppressor::new(48_000).unwrap();
        for _ in 0..300 {
            let mut frame = sine_frame(440.0, 0.3);
            suppressor.process(&mut frame).unwrap();
        }
        assert_eq!(suppressor.metrics().processed_frames, 300);
        assert!(suppressor.average_noise_level() > 0.0);
        assert!(suppressor.average_speech_probability() > 0.0);
        assert!(suppressor.noise_history.len() <= 100);
    }

    #[test]
    fn zero_crossing_rate_of_alternating_signal() {
        let samples: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!((zero_crossing_rate(&samples) - 1.0).abs() < f32::EPSILON);
        assert_eq!(zero_crossing_rate(&[1.0]), 0.0);
    }

    #[test]
    fn db_conversions_roundtrip() {
        let db = linear_to_db(0.5);
        assert!((db_to_linear(db) - 0.5).abs() < 1e-4);
        assert_eq!(linear_to_db(0.0), -100.0);
    }
}
