//! Call session: owns every component and wires the pipeline
//!
//! The session replaces any notion of global state: it owns the transport,
//! both frame queues, the audio workers and the preprocessor, hands each
//! component only the endpoint it needs, and tears everything down in
//! reverse order on stop. The binary holds the shared running flag and
//! flips it from the signal path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;

use crate::audio::buffer::{AudioFrame, FrameBuffer};
use crate::audio::capture::AudioCapture;
use crate::audio::playback::AudioPlayback;
use crate::audio::preprocess::{PreprocessStats, Preprocessor};
use crate::codec::{CodecStats, EncodedPacket};
use crate::config::{SessionConfig, TransportMode};
use crate::constants::BUFFER_CAPACITY;
use crate::error::{AudioError, Result};
use crate::network::{TransportStats, UdpTransport};

/// Report loss and jitter to the bitrate controller every this many packets
const LOSS_REPORT_INTERVAL: u32 = 50;

/// Expected inter-arrival time for 20 ms frames
const FRAME_INTERVAL_MS: f32 = 20.0;

/// Aggregate statistics snapshot across all components
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub tx_queued: usize,
    pub rx_queued: usize,
    pub tx_dropped: u64,
    pub rx_dropped: u64,
    pub transport: TransportStats,
    pub codec: CodecStats,
    pub periods_captured: u64,
    pub capture_overruns: u64,
    pub periods_played: u64,
    pub playback_underruns: u64,
    pub silence_periods: u64,
    pub preprocess: PreprocessStats,
}

/// Sequence-gap loss and inter-arrival jitter tracking on the receive path
struct LossTracker {
    next_expected: Option<u32>,
    received: u32,
    lost: u32,
    last_arrival: Option<Instant>,
    jitter_ms: f32,
}

impl LossTracker {
    fn new() -> Self {
        Self {
            next_expected: None,
            received: 0,
            lost: 0,
            last_arrival: None,
            jitter_ms: 0.0,
        }
    }

    /// Record one arrival; returns `(total, lost, jitter_ms)` once per
    /// reporting interval
    fn observe(&mut self, sequence: u32) -> Option<(u32, u32, f32)> {
        let now = Instant::now();
        if let Some(last) = self.last_arrival {
            let gap_ms = now.duration_since(last).as_secs_f32() * 1000.0;
            let deviation = (gap_ms - FRAME_INTERVAL_MS).abs();
            self.jitter_ms += (deviation - self.jitter_ms) / 16.0;
        }
        self.last_arrival = Some(now);

        match self.next_expected {
            Some(expected) if sequence < expected => {
                // Late arrival; already counted as lost, play it anyway.
            }
            Some(expected) => {
                self.lost += sequence - expected;
                self.next_expected = Some(sequence.wrapping_add(1));
            }
            None => self.next_expected = Some(sequence.wrapping_add(1)),
        }
        self.received += 1;

        if self.received >= LOSS_REPORT_INTERVAL {
            let report = (self.received + self.lost, self.lost, self.jitter_ms);
            self.received = 0;
            self.lost = 0;
            Some(report)
        } else {
            None
        }
    }
}

pub struct Session {
    config: SessionConfig,
    running: Arc<AtomicBool>,
    preprocessor: Arc<Preprocessor>,
    tx_buffer: Arc<FrameBuffer<EncodedPacket>>,
    rx_buffer: Arc<FrameBuffer<AudioFrame>>,
    transport: Arc<UdpTransport>,
    capture: AudioCapture,
    playback: AudioPlayback,
    sender: Option<JoinHandle<()>>,
    started: bool,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let preprocessor = Arc::new(Preprocessor::new(config.preprocess.clone())?);
        let tx_buffer = Arc::new(FrameBuffer::new(BUFFER_CAPACITY));
        let rx_buffer = Arc::new(FrameBuffer::new(BUFFER_CAPACITY));
        let transport = Arc::new(UdpTransport::new());

        let capture = AudioCapture::new(&config.device, tx_buffer.clone(), preprocessor.clone());
        let playback = AudioPlayback::new(&config.device, rx_buffer.clone());

        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            preprocessor,
            tx_buffer,
            rx_buffer,
            transport,
            capture,
            playback,
            sender: None,
            started: false,
            config,
        })
    }

    /// Flag observed by every worker; the signal handler flips it
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Bring up transport, playback, capture and the sender loop
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        self.preprocessor
            .set_on_speech_detected(|speech| tracing::debug!(speech, "speech state changed"));
        self.preprocessor
            .set_on_bitrate_changed(|bps| tracing::info!(bitrate = bps, "bitrate adapted"));

        let handler = {
            let preprocessor = self.preprocessor.clone();
            let rx_buffer = self.rx_buffer.clone();
            let tracker = Mutex::new(LossTracker::new());
            move |packet: EncodedPacket, _from: std::net::SocketAddr| {
                if let Some((total, lost, jitter)) = tracker.lock().observe(packet.sequence) {
                    preprocessor.report_packet_loss(total, lost);
                    preprocessor.report_jitter(jitter);
                }
                match preprocessor.decode_packet(&packet) {
                    Ok(samples) => {
                        rx_buffer.push(AudioFrame::new(samples, packet.sequence));
                    }
                    Err(e) => tracing::warn!("decode failed: {e}"),
                }
            }
        };

        match &self.config.mode {
            TransportMode::Listener { local_port } => {
                self.transport.start_listener(*local_port, handler)?
            }
            TransportMode::Initiator { remote } => {
                self.transport.start_initiator(*remote, handler)?
            }
            TransportMode::Peer {
                remote_ip,
                local_port,
                remote_port,
            } => self
                .transport
                .start_peer(*remote_ip, *local_port, *remote_port, handler)?,
        }

        self.playback.start()?;
        self.capture.start()?;

        let running = self.running.clone();
        let tx_buffer = self.tx_buffer.clone();
        let transport = self.transport.clone();
        let sender = thread::Builder::new()
            .name("udp-send".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let Some(packet) = tx_buffer.pop_wait() else {
                        continue;
                    };
                    if let Err(e) = transport.send_frame(&packet) {
                        // Counted by the transport; the frame is gone either way.
                        tracing::debug!("send failed: {e}");
                    }
                }
            })?;
        self.sender = Some(sender);

        self.started = true;
        tracing::info!(mode = ?self.config.mode, "session started");
        Ok(())
    }

    /// Tear down in reverse of creation order and clear the queues
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        self.capture.stop();
        if let Some(handle) = self.sender.take() {
            let _ = handle.join();
        }
        self.playback.stop();
        self.transport.stop();

        self.tx_buffer.clear();
        self.rx_buffer.clear();

        self.started = false;
        tracing::info!("session stopped");
    }

    /// Fatal device error from either audio worker, if one occurred
    ///
    /// The caller treats this as end-of-call.
    pub fn device_error(&self) -> Option<AudioError> {
        self.capture
            .take_error()
            .or_else(|| self.playback.take_error())
    }

    pub fn set_gain(&self, gain: f32) {
        self.capture.set_gain(gain);
    }

    pub fn set_volume(&self, volume: f32) {
        self.playback.set_volume(volume);
    }

    pub fn set_muted(&self, muted: bool) {
        self.playback.set_muted(muted);
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.transport
    }

    pub fn preprocessor(&self) -> &Arc<Preprocessor> {
        &self.preprocessor
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            tx_queued: self.tx_buffer.len(),
            rx_queued: self.rx_buffer.len(),
            tx_dropped: self.tx_buffer.dropped(),
            rx_dropped: self.rx_buffer.dropped(),
            transport: self.transport.stats(),
            codec: self.preprocessor.codec_stats(),
            periods_captured: self.capture.periods_captured(),
            capture_overruns: self.capture.overruns(),
            periods_played: self.playback.periods_played(),
            playback_underruns: self.playback.underruns(),
            silence_periods: self.playback.silence_periods(),
            preprocess: self.preprocessor.stats(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
