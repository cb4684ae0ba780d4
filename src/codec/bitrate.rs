//! Adaptive bitrate control
//!
//! Blends network conditions (loss, latency, bandwidth) with audio
//! characteristics (speech presence, level, SNR) into a target bitrate,
//! then smooths the transition so the codec is not whipsawed by noisy
//! measurements. Changes are committed only when they cross a relative
//! stability threshold.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::constants::{DEFAULT_BITRATE, MAX_BITRATE, MIN_BITRATE};

/// Policy constraining the controller's output range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityMode {
    /// Always the minimum bitrate
    PowerSave,
    /// Never above the default bitrate
    Balanced,
    /// Always the maximum bitrate
    HighQuality,
    /// Bounded by the configured quality factor
    Adaptive,
}

/// Point-in-time view of the network path
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkMetrics {
    /// Packet loss ratio in [0, 1]
    pub packet_loss: f32,
    /// Exponentially smoothed latency in milliseconds
    pub latency_ms: f32,
    /// Inter-arrival jitter in milliseconds
    pub jitter_ms: f32,
    /// Observed bandwidth in kbps; 0 when unknown
    pub bandwidth_kbps: f32,
}

/// Per-frame audio characteristics
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioMetrics {
    /// Signal-to-noise ratio in dB
    pub snr_db: f32,
    /// RMS level in [0, 1]
    pub rms: f32,
    pub speech_detected: bool,
    /// Most recent speech probability in [0, 1]
    pub speech_probability: f32,
}

/// Latency smoothing factor for [`BitrateController::report_latency`]
const LATENCY_EMA_ALPHA: f32 = 0.3;

/// Committed values older than this are aged out of the history
const HISTORY_MAX_AGE: Duration = Duration::from_secs(600);

const HISTORY_MAX_LEN: usize = 100;

struct Inner {
    network: NetworkMetrics,
    audio: AudioMetrics,
    history: VecDeque<(u32, Instant)>,
    changes: u64,
    mode: QualityMode,
    adaptation_speed: f32,
    stability_threshold: f32,
    quality_factor: f32,
    auto_adaptation: bool,
}

pub struct BitrateController {
    current: AtomicU32,
    inner: Mutex<Inner>,
}

impl BitrateController {
    pub fn new(initial_bitrate: u32) -> Self {
        let initial = clamp_bitrate(initial_bitrate);
        let mut history = VecDeque::with_capacity(HISTORY_MAX_LEN);
        history.push_back((initial, Instant::now()));

        Self {
            current: AtomicU32::new(initial),
            inner: Mutex::new(Inner {
                network: NetworkMetrics::default(),
                audio: AudioMetrics::default(),
                history,
                changes: 0,
                mode: QualityMode::Adaptive,
                adaptation_speed: 0.3,
                stability_threshold: 0.1,
                quality_factor: 0.5,
                auto_adaptation: true,
            }),
        }
    }

    /// Bitrate the encode path should currently use
    pub fn current_bitrate(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    /// Store fresh network metrics and re-run the calculation
    pub fn update_network_metrics(&self, metrics: NetworkMetrics) {
        let mut inner = self.inner.lock();
        inner.network = metrics;
        if inner.auto_adaptation {
            self.recompute_locked(&mut inner);
        }
    }

    /// Store fresh audio metrics and re-run the calculation
    pub fn update_audio_metrics(&self, metrics: AudioMetrics) {
        let mut inner = self.inner.lock();
        inner.audio = metrics;
        if inner.auto_adaptation {
            self.recompute_locked(&mut inner);
        }
    }

    pub fn report_packet_loss(&self, total_packets: u32, lost_packets: u32) {
        if total_packets == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.network.packet_loss = lost_packets as f32 / total_packets as f32;
    }

    /// Fold a latency sample into the exponential moving average
    pub fn report_latency(&self, latency_ms: f32) {
        let mut inner = self.inner.lock();
        inner.network.latency_ms =
            LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * inner.network.latency_ms;
    }

    pub fn report_bandwidth(&self, bandwidth_kbps: f32) {
        self.inner.lock().network.bandwidth_kbps = bandwidth_kbps;
    }

    pub fn report_jitter(&self, jitter_ms: f32) {
        self.inner.lock().network.jitter_ms = jitter_ms;
    }

    /// Recompute from the stored metrics; returns the committed bitrate
    pub fn recompute(&self) -> u32 {
        let mut inner = self.inner.lock();
        self.recompute_locked(&mut inner);
        self.current.load(Ordering::Relaxed)
    }

    pub fn set_quality_mode(&self, mode: QualityMode) {
        let mut inner = self.inner.lock();
        inner.mode = mode;
        if inner.auto_adaptation {
            self.recompute_locked(&mut inner);
        }
    }

    pub fn quality_mode(&self) -> QualityMode {
        self.inner.lock().mode
    }

    /// Transition speed in [0, 1]; 1 jumps straight to the target
    pub fn set_adaptation_speed(&self, speed: f32) {
        self.inner.lock().adaptation_speed = speed.clamp(0.0, 1.0);
    }

    /// Minimum relative change required to commit, in [0, 1]
    pub fn set_stability_threshold(&self, threshold: f32) {
        self.inner.lock().stability_threshold = threshold.clamp(0.0, 1.0);
    }

    /// Quality factor for [`QualityMode::Adaptive`], in [0, 1]
    pub fn set_quality_factor(&self, factor: f32) {
        self.inner.lock().quality_factor = factor.clamp(0.0, 1.0);
    }

    pub fn enable_auto_adaptation(&self, enable: bool) {
        self.inner.lock().auto_adaptation = enable;
    }

    pub fn network_metrics(&self) -> NetworkMetrics {
        self.inner.lock().network
    }

    pub fn audio_metrics(&self) -> AudioMetrics {
        self.inner.lock().audio
    }

    /// Mean of the committed values still in the history window
    pub fn average_bitrate(&self) -> f32 {
        let inner = self.inner.lock();
        if inner.history.is_empty() {
            return self.current.load(Ordering::Relaxed) as f32;
        }
        let sum: u64 = inner.history.iter().map(|(b, _)| *b as u64).sum();
        sum as f32 / inner.history.len() as f32
    }

    /// Number of committed bitrate changes
    pub fn change_count(&self) -> u64 {
        self.inner.lock().changes
    }

    pub fn history(&self) -> Vec<u32> {
        self.inner.lock().history.iter().map(|(b, _)| *b).collect()
    }

    fn recompute_locked(&self, inner: &mut Inner) {
        let current = self.current.load(Ordering::Relaxed);

        let network_target = network_based_bitrate(&inner.network);
        let audio_target = audio_based_bitrate(&inner.audio);
        let combined = (network_target as f32 * 0.6 + audio_target as f32 * 0.4) as u32;
        let adjusted = apply_quality_mode(combined, inner.mode, inner.quality_factor);

        let diff = adjusted as f32 - current as f32;
        let smoothed = clamp_bitrate((current as f32 + diff * inner.adaptation_speed) as u32);

        let change_ratio = (smoothed as f32 - current as f32).abs() / current as f32;
        if change_ratio < inner.stability_threshold {
            return;
        }

        self.current.store(smoothed, Ordering::Relaxed);
        inner.changes += 1;
        Self::push_history(&mut inner.history, smoothed);

        tracing::debug!(
            old = current,
            new = smoothed,
            target = adjusted,
            "bitrate committed"
        );
    }

    fn push_history(history: &mut VecDeque<(u32, Instant)>, bitrate: u32) {
        let now = Instant::now();
        history.push_back((bitrate, now));
        while history.len() > HISTORY_MAX_LEN {
            history.pop_front();
        }
        while let Some((_, ts)) = history.front() {
            if now.duration_since(*ts) > HISTORY_MAX_AGE {
                history.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Target from the network tables: loss and latency tiers, bandwidth cap
fn network_based_bitrate(metrics: &NetworkMetrics) -> u32 {
    let mut bitrate = DEFAULT_BITRATE;

    if metrics.packet_loss > 0.05 {
        bitrate = MIN_BITRATE;
    } else if metrics.packet_loss > 0.02 {
        bitrate = (MIN_BITRATE + DEFAULT_BITRATE) / 2;
    }

    if metrics.latency_ms > 500.0 {
        bitrate = bitrate.min(MIN_BITRATE);
    } else if metrics.latency_ms > 200.0 {
        bitrate = bitrate.min((MIN_BITRATE + DEFAULT_BITRATE) / 2);
    }

    if metrics.bandwidth_kbps > 0.0 {
        let usable = (metrics.bandwidth_kbps * 1000.0 * 0.8) as u32;
        bitrate = bitrate.min(usable);
    }

    bitrate
}

/// Target from the audio tables: silence floors, level and SNR tiers
fn audio_based_bitrate(metrics: &AudioMetrics) -> u32 {
    if !metrics.speech_detected {
        return MIN_BITRATE;
    }

    let mut bitrate = DEFAULT_BITRATE;

    if metrics.rms > 0.7 {
        bitrate = MAX_BITRATE;
    } else if metrics.rms < 0.1 {
        bitrate = MIN_BITRATE;
    }

    if metrics.snr_db > 20.0 {
        bitrate = bitrate.max(DEFAULT_BITRATE);
    } else if metrics.snr_db < 10.0 {
        bitrate = MIN_BITRATE;
    }

    bitrate
}

fn apply_quality_mode(bitrate: u32, mode: QualityMode, quality_factor: f32) -> u32 {
    match mode {
        QualityMode::PowerSave => MIN_BITRATE,
        QualityMode::Balanced => bitrate.min(DEFAULT_BITRATE),
        QualityMode::HighQuality => bitrate.max(MAX_BITRATE),
        QualityMode::Adaptive => {
            let ceiling =
                MIN_BITRATE + ((MAX_BITRATE - MIN_BITRATE) as f32 * quality_factor) as u32;
            bitrate.min(ceiling)
        }
    }
}

fn clamp_bitrate(bitrate: u32) -> u32 {
    bitrate.clamp(MIN_BITRATE, MAX_BITRATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech_metrics() -> AudioMetrics {
        AudioMetrics {
            snr_db: 25.0,
            rms: 0.8,
            speech_detected: true,
            speech_probability: 0.9,
        }
    }

    #[test]
    fn initial_bitrate_is_clamped() {
        assert_eq!(BitrateController::new(100).current_bitrate(), MIN_BITRATE);
        assert_eq!(
            BitrateController::new(1_000_000).current_bitrate(),
            MAX_BITRATE
        );
    }

    #[test]
    fn committed_bitrate_stays_in_range() {
        let controller = BitrateController::new(DEFAULT_BITRATE);
        let extremes = [
            NetworkMetrics {
                packet_loss: 1.0,
                latency_ms: 10_000.0,
                jitter_ms: 500.0,
                bandwidth_kbps: 0.001,
            },
            NetworkMetrics {
                packet_loss: 0.0,
                latency_ms: 0.0,
                jitter_ms: 0.0,
                bandwidth_kbps: 1_000_000.0,
            },
        ];
        for metrics in extremes {
            for _ in 0..20 {
                controller.update_network_metrics(metrics);
                let bitrate = controller.current_bitrate();
                assert!((MIN_BITRATE..=MAX_BITRATE).contains(&bitrate));
            }
        }
    }

    #[test]
    fn falls_under_loss() {
        // 10% loss on a 100 ms path drives the rate toward the floor.
        let controller = BitrateController::new(DEFAULT_BITRATE);
        controller.report_packet_loss(100, 10);
        controller.report_latency(100.0);

        let mut committed = controller.current_bitrate();
        for _ in 0..10 {
            committed = controller.recompute();
        }
        assert!(
            committed <= (MIN_BITRATE + DEFAULT_BITRATE) / 2,
            "expected <= 4600, got {committed}"
        );
    }

    #[test]
    fn rises_under_clean_channel_with_speech() {
        // Recovery toward the ceiling needs HighQuality: in the default
        // Adaptive mode the quality factor caps the target at 6200 bps, so
        // no clean-channel input can lift the committed rate past it (see
        // adaptive_ceiling_caps_clean_channel_recovery below).
        let controller = BitrateController::new(MIN_BITRATE);
        controller.set_quality_mode(QualityMode::HighQuality);
        controller.update_network_metrics(NetworkMetrics {
            packet_loss: 0.0,
            latency_ms: 50.0,
            jitter_ms: 0.0,
            bandwidth_kbps: 0.0,
        });

        let mut committed = controller.current_bitrate();
        for _ in 0..10 {
            controller.update_audio_metrics(speech_metrics());
            committed = controller.current_bitrate();
        }
        assert!(committed >= 8000, "expected >= 8000, got {committed}");
    }

    #[test]
    fn adaptive_ceiling_caps_clean_channel_recovery() {
        // Default configuration: Adaptive mode with quality factor 0.5,
        // ceiling MIN + 0.5*(MAX-MIN) = 6200. Loud clean speech targets
        // 0.6*6000 + 0.4*9200 = 7280, the ceiling cuts that to 6200, and
        // the 0.3 smoothing under the 0.1 stability threshold plateaus the
        // committed value below even that ceiling.
        let controller = BitrateController::new(MIN_BITRATE);
        controller.update_network_metrics(NetworkMetrics {
            packet_loss: 0.0,
            latency_ms: 50.0,
            jitter_ms: 0.0,
            bandwidth_kbps: 0.0,
        });

        let mut trace = Vec::new();
        for _ in 0..10 {
            controller.update_audio_metrics(speech_metrics());
            trace.push(controller.current_bitrate());
        }

        let peak = *trace.iter().max().unwrap();
        assert!(peak > MIN_BITRATE, "recovery should start: {trace:?}");
        assert!(peak <= 6200, "Adaptive ceiling violated: {trace:?}");
        // The stability threshold freezes the climb short of the ceiling.
        let last = *trace.last().unwrap();
        assert_eq!(trace[trace.len() - 2], last, "should plateau: {trace:?}");
    }

    #[test]
    fn identical_metrics_settle() {
        let controller = BitrateController::new(DEFAULT_BITRATE);
        let metrics = NetworkMetrics {
            packet_loss: 0.1,
            latency_ms: 100.0,
            ..Default::default()
        };

        let mut trace = Vec::new();
        for _ in 0..12 {
            controller.update_network_metrics(metrics);
            trace.push(controller.current_bitrate());
        }

        // Once the stability threshold suppresses a change, it stays
        // suppressed for identical inputs.
        let settled = *trace.last().unwrap();
        let first_settled = trace.iter().position(|&b| b == settled).unwrap();
        assert!(trace[first_settled..].iter().all(|&b| b == settled));
        assert!(first_settled <= 3, "settled too slowly: {trace:?}");
    }

    #[test]
    fn silence_floors_audio_target() {
        assert_eq!(
            audio_based_bitrate(&AudioMetrics {
                speech_detected: false,
                rms: 0.9,
                snr_db: 30.0,
                speech_probability: 0.0,
            }),
            MIN_BITRATE
        );
    }

    #[test]
    fn bandwidth_caps_network_target() {
        let metrics = NetworkMetrics {
            bandwidth_kbps: 5.0,
            ..Default::default()
        };
        assert_eq!(network_based_bitrate(&metrics), 4000);
    }

    #[test]
    fn quality_modes_constrain_output() {
        assert_eq!(apply_quality_mode(9000, QualityMode::PowerSave, 0.5), MIN_BITRATE);
        assert_eq!(
            apply_quality_mode(9000, QualityMode::Balanced, 0.5),
            DEFAULT_BITRATE
        );
        assert_eq!(
            apply_quality_mode(3200, QualityMode::HighQuality, 0.5),
            MAX_BITRATE
        );
        // Adaptive: ceiling at MIN + 0.5 * (MAX - MIN) = 6200.
        assert_eq!(apply_quality_mode(9000, QualityMode::Adaptive, 0.5), 6200);
        assert_eq!(apply_quality_mode(4000, QualityMode::Adaptive, 0.5), 4000);
    }

    #[test]
    fn latency_report_smooths() {
        let controller = BitrateController::new(DEFAULT_BITRATE);
        controller.report_latency(100.0);
        let first = controller.network_metrics().latency_ms;
        assert!((first - 30.0).abs() < 0.01);
        controller.report_latency(100.0);
        let second = controller.network_metrics().latency_ms;
        assert!(second > first && second < 100.0);
    }

    #[test]
    fn history_is_bounded() {
        let controller = BitrateController::new(DEFAULT_BITRATE);
        // Alternate extreme targets so commits keep happening.
        for i in 0..300 {
            let loss = if i % 2 == 0 { 0.5 } else { 0.0 };
            controller.set_quality_mode(if i % 2 == 0 {
                QualityMode::PowerSave
            } else {
                QualityMode::HighQuality
            });
            controller.update_network_metrics(NetworkMetrics {
                packet_loss: loss,
                ..Default::default()
            });
        }
        assert!(controller.history().len() <= 100);
        assert!(controller.change_count() > 0);
        assert!(controller.average_bitrate() >= MIN_BITRATE as f32);
    }
}
