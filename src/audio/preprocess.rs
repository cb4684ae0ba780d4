//! Signal-processing chain for both directions
//!
//! The preprocessor owns the codec and the bitrate controller and runs the
//! capture-side chain (AGC, denoise, VAD attenuation) before encoding, and
//! the playback-side chain (volume gain) after decoding. Encode and decode
//! run on different threads; the codec sits behind a short-lived lock and
//! the scalar state behind atomics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{
    self, AudioMetrics, BitrateController, EncodedPacket, NetworkMetrics, VoiceCodec,
};
use crate::config::PreprocessConfig;
use crate::constants::{DENOISE_FRAME_SIZE, DEVICE_FRAME_SIZE, SAMPLE_RATE};
use crate::error::{CodecError, Error, Result};

use super::noise::{self, NoiseMetrics, NoiseSuppressor};
use super::AtomicF32;

/// AGC smoothing factor: the gain moves 10% of the way to its target per
/// processed block
const AGC_ALPHA: f32 = 0.1;

const AGC_MIN_GAIN: f32 = 0.1;
const AGC_MAX_GAIN: f32 = 2.0;
const GAIN_HISTORY_LEN: usize = 50;

/// Attenuation applied to frames below the speech gate
const VAD_ATTENUATION: f32 = 0.1;

struct AgcState {
    gain: f32,
    target: f32,
    history: VecDeque<f32>,
}

type SpeechCallback = Box<dyn Fn(bool) + Send + Sync>;
type BitrateCallback = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_speech: Option<SpeechCallback>,
    on_bitrate: Option<BitrateCallback>,
}

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct PreprocessStats {
    pub samples_processed: u64,
    pub frames_processed: u64,
    pub current_gain: f32,
    pub current_bitrate: u32,
    pub speech_detected: bool,
    pub noise: Option<NoiseMetrics>,
}

pub struct Preprocessor {
    config: PreprocessConfig,
    suppressor: Option<Mutex<NoiseSuppressor>>,
    codec: Mutex<Box<dyn VoiceCodec>>,
    controller: Option<Arc<BitrateController>>,
    agc: Mutex<AgcState>,
    current_gain: AtomicF32,
    speech_active: AtomicBool,
    next_sequence: AtomicU32,
    samples_processed: AtomicU64,
    frames_processed: AtomicU64,
    callbacks: Mutex<Callbacks>,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self> {
        config.validate()?;

        let suppressor = if config.enable_noise_suppression {
            let mut suppressor = NoiseSuppressor::new(SAMPLE_RATE)?;
            suppressor.set_suppression_level(config.noise_suppression_level);
            suppressor.set_threshold(config.vad_threshold);
            // The preprocessor owns the VAD attenuation step so it is not
            // applied twice.
            suppressor.enable_vad(false);
            Some(Mutex::new(suppressor))
        } else {
            None
        };

        let codec = codec::build_codec(&config).map_err(Error::Codec)?;

        let controller = config
            .enable_bitrate_adaptation
            .then(|| Arc::new(BitrateController::new(config.target_bitrate)));

        tracing::info!(
            noise_suppression = config.enable_noise_suppression,
            codec = config.enable_codec,
            vad = config.enable_vad,
            agc = config.enable_agc,
            bitrate_adaptation = config.enable_bitrate_adaptation,
            bitrate = config.target_bitrate,
            "preprocessor ready"
        );

        Ok(Self {
            agc: Mutex::new(AgcState {
                gain: 1.0,
                target: config.agc_target_level,
                history: VecDeque::with_capacity(GAIN_HISTORY_LEN),
            }),
            current_gain: AtomicF32::new(1.0),
            speech_active: AtomicBool::new(false),
            next_sequence: AtomicU32::new(0),
            samples_processed: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            callbacks: Mutex::new(Callbacks::default()),
            suppressor,
            codec: Mutex::new(codec),
            controller,
            config,
        })
    }

    /// Capture-side chain: AGC, denoise, VAD attenuation
    pub fn process_input(&self, samples: &mut [f32]) {
        if self.config.enable_agc {
            self.apply_agc(samples);
        }

        let mut speech_probability = 0.5;
        if let Some(suppressor) = &self.suppressor {
            let mut suppressor = suppressor.lock();
            for chunk in samples.chunks_exact_mut(DENOISE_FRAME_SIZE) {
                // Frame length is fixed by the chunker.
                let _ = suppressor.process(chunk);
            }
            speech_probability = suppressor.speech_probability();
        }

        let speech = speech_probability > self.config.vad_threshold;
        if self.config.enable_vad && !speech {
            for sample in samples.iter_mut() {
                *sample *= VAD_ATTENUATION;
            }
        }

        let was_speech = self.speech_active.swap(speech, Ordering::Relaxed);
        if was_speech != speech {
            if let Some(callback) = &self.callbacks.lock().on_speech {
                callback(speech);
            }
        }

        self.samples_processed
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Playback-side chain: volume gain only
    pub fn process_output(&self, samples: &mut [f32]) {
        if !self.config.enable_agc {
            return;
        }
        let gain = self.current_gain.load();
        for sample in samples.iter_mut() {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }
    }

    /// Process and compress one 20 ms frame at the device rate
    pub fn encode_frame(&self, samples: &[i16]) -> Result<EncodedPacket> {
        if samples.len() != DEVICE_FRAME_SIZE {
            return Err(Error::Codec(CodecError::InvalidFrameLength {
                got: samples.len(),
                expected: DEVICE_FRAME_SIZE,
            }));
        }

        let mut buffer = samples_to_f32(samples);
        self.process_input(&mut buffer);
        self.publish_audio_metrics(&buffer);
        self.sync_bitrate();

        let processed = f32_to_samples(&buffer);
        let mut codec = self.codec.lock();
        let resampled = if codec.sample_rate() != SAMPLE_RATE {
            codec::resample_linear(&processed, SAMPLE_RATE, codec.sample_rate())
        } else {
            processed
        };

        let payload = codec.encode(&resampled).map_err(Error::Codec)?;
        let bitrate = codec.bitrate();
        drop(codec);

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        Ok(EncodedPacket::new(payload, sequence, bitrate))
    }

    /// Decompress a packet back to 20 ms of PCM at the device rate
    pub fn decode_packet(&self, packet: &EncodedPacket) -> Result<Vec<i16>> {
        let mut codec = self.codec.lock();
        let decoded = codec.decode(&packet.payload).map_err(Error::Codec)?;
        let codec_rate = codec.sample_rate();
        drop(codec);

        let resampled = if codec_rate != SAMPLE_RATE {
            codec::resample_linear(&decoded, codec_rate, SAMPLE_RATE)
        } else {
            decoded
        };

        let mut buffer = samples_to_f32(&resampled);
        self.process_output(&mut buffer);
        Ok(f32_to_samples(&buffer))
    }

    pub fn update_network_metrics(&self, metrics: NetworkMetrics) {
        if let Some(controller) = &self.controller {
            controller.update_network_metrics(metrics);
            self.sync_bitrate();
        }
    }

    pub fn report_packet_loss(&self, total_packets: u32, lost_packets: u32) {
        if let Some(controller) = &self.controller {
            controller.report_packet_loss(total_packets, lost_packets);
            controller.recompute();
            self.sync_bitrate();
        }
    }

    pub fn report_latency(&self, latency_ms: f32) {
        if let Some(controller) = &self.controller {
            controller.report_latency(latency_ms);
        }
    }

    pub fn report_bandwidth(&self, bandwidth_kbps: f32) {
        if let Some(controller) = &self.controller {
            controller.report_bandwidth(bandwidth_kbps);
        }
    }

    pub fn report_jitter(&self, jitter_ms: f32) {
        if let Some(controller) = &self.controller {
            controller.report_jitter(jitter_ms);
        }
    }

    /// Apply a committed bitrate change to the codec
    ///
    /// Called from the metric-reporting paths and from the encode path, so
    /// a change always lands before the next encoded frame.
    fn sync_bitrate(&self) {
        let Some(controller) = &self.controller else {
            return;
        };
        let target = controller.current_bitrate();
        let mut codec = self.codec.lock();
        if codec.bitrate() == target {
            return;
        }
        if let Err(e) = codec.set_bitrate(target) {
            tracing::warn!("bitrate change to {target} bps rejected: {e}");
            return;
        }
        drop(codec);
        tracing::debug!(bitrate = target, "codec bitrate updated");
        if let Some(callback) = &self.callbacks.lock().on_bitrate {
            callback(target);
        }
    }

    fn publish_audio_metrics(&self, samples: &[f32]) {
        let (Some(controller), Some(suppressor)) = (&self.controller, &self.suppressor) else {
            return;
        };

        let level = noise::rms(samples);
        let suppressor = suppressor.lock();
        let probability = suppressor.speech_probability();
        let noise_floor = (suppressor.average_noise_level() / 10.0).max(1e-4);
        drop(suppressor);

        let snr_db = (noise::linear_to_db(level.max(1e-4)) - noise::linear_to_db(noise_floor))
            .clamp(0.0, 40.0);

        controller.update_audio_metrics(AudioMetrics {
            snr_db,
            rms: level.min(1.0),
            speech_detected: self.speech_active.load(Ordering::Relaxed),
            speech_probability: probability,
        });
    }

    fn apply_agc(&self, samples: &mut [f32]) {
        let level = noise::rms(samples);
        let mut agc = self.agc.lock();
        if level > 0.0 {
            let desired = agc.target / level;
            agc.gain = (AGC_ALPHA * desired + (1.0 - AGC_ALPHA) * agc.gain)
                .clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
            if agc.history.len() >= GAIN_HISTORY_LEN {
                agc.history.pop_front();
            }
            let gain = agc.gain;
            agc.history.push_back(gain);
            self.current_gain.store(gain);
        }
        let gain = agc.gain;
        drop(agc);

        for sample in samples.iter_mut() {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }
    }

    pub fn set_on_speech_detected(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.callbacks.lock().on_speech = Some(Box::new(callback));
    }

    pub fn set_on_bitrate_changed(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.callbacks.lock().on_bitrate = Some(Box::new(callback));
    }

    pub fn set_noise_suppression_level(&self, level: f32) {
        if let Some(suppressor) = &self.suppressor {
            suppressor.lock().set_suppression_level(level);
        }
    }

    pub fn set_vad_threshold(&self, threshold: f32) {
        if let Some(suppressor) = &self.suppressor {
            suppressor.lock().set_threshold(threshold);
        }
    }

    pub fn set_target_gain(&self, gain: f32) {
        self.agc.lock().target = gain.clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
    }

    /// Manual bitrate override; adaptation may move it again afterwards
    pub fn set_bitrate(&self, bitrate: u32) -> Result<()> {
        self.codec
            .lock()
            .set_bitrate(bitrate)
            .map_err(Error::Codec)
    }

    pub fn is_speech_detected(&self) -> bool {
        self.speech_active.load(Ordering::Relaxed)
    }

    pub fn current_gain(&self) -> f32 {
        self.current_gain.load()
    }

    pub fn current_bitrate(&self) -> u32 {
        self.codec.lock().bitrate()
    }

    pub fn controller(&self) -> Option<&Arc<BitrateController>> {
        self.controller.as_ref()
    }

    pub fn codec_stats(&self) -> crate::codec::CodecStats {
        self.codec.lock().stats()
    }

    pub fn stats(&self) -> PreprocessStats {
        PreprocessStats {
            samples_processed: self.samples_processed.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            current_gain: self.current_gain.load(),
            current_bitrate: self.current_bitrate(),
            speech_detected: self.is_speech_detected(),
            noise: self.suppressor.as_ref().map(|s| s.lock().metrics()),
        }
    }
}

fn samples_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

fn f32_to_samples(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_BITRATE, MAX_BITRATE, MIN_BITRATE};
    use crate::codec::QualityMode;
    use std::sync::atomic::AtomicUsize;

    fn plain_config() -> PreprocessConfig {
        PreprocessConfig {
            enable_noise_suppression: false,
            enable_codec: false,
            enable_bitrate_adaptation: false,
            enable_vad: false,
            enable_agc: false,
            ..Default::default()
        }
    }

    fn speech_frame(amplitude: f32) -> Vec<i16> {
        (0..DEVICE_FRAME_SIZE)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * amplitude * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn sequence_numbers_start_at_zero_and_increase() {
        let preprocessor = Preprocessor::new(plain_config()).unwrap();
        let frame = vec![0i16; DEVICE_FRAME_SIZE];
        let mut last = None;
        for expected in 0..5u32 {
            let packet = preprocessor.encode_frame(&frame).unwrap();
            assert_eq!(packet.sequence, expected);
            if let Some(prev) = last {
                assert!(packet.sequence > prev);
            }
            last = Some(packet.sequence);
        }
    }

    #[test]
    fn encode_rejects_wrong_length() {
        let preprocessor = Preprocessor::new(plain_config()).unwrap();
        assert!(preprocessor.encode_frame(&vec![0i16; 100]).is_err());
    }

    #[test]
    fn decode_returns_device_rate_frame() {
        let preprocessor = Preprocessor::new(plain_config()).unwrap();
        let packet = preprocessor.encode_frame(&speech_frame(0.3)).unwrap();
        let decoded = preprocessor.decode_packet(&packet).unwrap();
        assert_eq!(decoded.len(), DEVICE_FRAME_SIZE);
    }

    #[test]
    fn silent_frame_stays_silent_end_to_end() {
        let preprocessor = Preprocessor::new(plain_config()).unwrap();
        let packet = preprocessor.encode_frame(&vec![0i16; DEVICE_FRAME_SIZE]).unwrap();
        let decoded = preprocessor.decode_packet(&packet).unwrap();
        assert!(decoded.iter().all(|&s| s == 0));
    }

    #[test]
    fn opus_path_payloads_fit_a_datagram() {
        let preprocessor = Preprocessor::new(PreprocessConfig::default()).unwrap();
        for _ in 0..10 {
            let packet = preprocessor.encode_frame(&speech_frame(0.5)).unwrap();
            assert!(packet.payload.len() <= 1020);
            assert!((MIN_BITRATE..=MAX_BITRATE).contains(&packet.bitrate));
        }
    }

    #[test]
    fn agc_output_is_clipped() {
        let config = PreprocessConfig {
            enable_noise_suppression: false,
            enable_vad: false,
            enable_codec: false,
            enable_bitrate_adaptation: false,
            ..Default::default()
        };
        let preprocessor = Preprocessor::new(config).unwrap();
        let mut samples = vec![0.9f32; DEVICE_FRAME_SIZE];
        // Drive the gain up first with a quiet stretch.
        for _ in 0..50 {
            let mut quiet = vec![0.05f32; DEVICE_FRAME_SIZE];
            preprocessor.process_input(&mut quiet);
        }
        preprocessor.process_input(&mut samples);
        assert!(samples.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[test]
    fn agc_raises_gain_for_quiet_input() {
        let config = PreprocessConfig {
            enable_noise_suppression: false,
            enable_vad: false,
            enable_codec: false,
            enable_bitrate_adaptation: false,
            agc_target_level: 0.7,
            ..Default::default()
        };
        let preprocessor = Preprocessor::new(config).unwrap();
        for _ in 0..30 {
            let mut quiet = vec![0.05f32; DEVICE_FRAME_SIZE];
            preprocessor.process_input(&mut quiet);
        }
        assert!(preprocessor.current_gain() > 1.0);
        assert!(preprocessor.current_gain() <= 2.0);
    }

    #[test]
    fn speech_callback_fires_on_flip() {
        let config = PreprocessConfig {
            enable_codec: false,
            enable_bitrate_adaptation: false,
            enable_agc: false,
            ..Default::default()
        };
        let preprocessor = Preprocessor::new(config).unwrap();
        let flips = Arc::new(AtomicUsize::new(0));
        let counter = flips.clone();
        preprocessor.set_on_speech_detected(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let mut loud = samples_to_f32(&speech_frame(0.5));
        preprocessor.process_input(&mut loud);
        assert!(preprocessor.is_speech_detected());
        assert_eq!(flips.load(Ordering::Relaxed), 1);

        // Same state again: no callback.
        let mut loud = samples_to_f32(&speech_frame(0.5));
        preprocessor.process_input(&mut loud);
        assert_eq!(flips.load(Ordering::Relaxed), 1);

        let mut silence = vec![0.0f32; DEVICE_FRAME_SIZE];
        preprocessor.process_input(&mut silence);
        assert!(!preprocessor.is_speech_detected());
        assert_eq!(flips.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn committed_bitrate_reaches_codec_and_callback() {
        let preprocessor = Preprocessor::new(PreprocessConfig::default()).unwrap();
        let reported = Arc::new(AtomicU32::new(0));
        let sink = reported.clone();
        preprocessor.set_on_bitrate_changed(move |bps| {
            sink.store(bps, Ordering::Relaxed);
        });

        let controller = preprocessor.controller().unwrap().clone();
        // Full speed jumps straight to the mode floor.
        controller.set_adaptation_speed(1.0);
        controller.set_quality_mode(QualityMode::PowerSave);
        controller.recompute();
        preprocessor.sync_bitrate();

        assert_eq!(preprocessor.current_bitrate(), MIN_BITRATE);
        assert_eq!(reported.load(Ordering::Relaxed), MIN_BITRATE);
    }

    #[test]
    fn stats_reflect_activity() {
        let preprocessor = Preprocessor::new(plain_config()).unwrap();
        let _ = preprocessor.encode_frame(&speech_frame(0.2));
        let stats = preprocessor.stats();
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.samples_processed, DEVICE_FRAME_SIZE as u64);
        assert_eq!(stats.current_bitrate, DEFAULT_BITRATE);
    }
}
