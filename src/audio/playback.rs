//! Speaker playback worker
//!
//! A feeder thread pops decoded frames from the jitter buffer with a short
//! bounded wait and extends a shared sample deque; when the buffer is
//! starved it feeds a zero-filled period instead of stalling, so the output
//! stream never pauses. The cpal callback drains the deque and zero-fills
//! any shortfall, counting it as an underrun.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::constants::FRAMES_PER_BUFFER;
use crate::error::AudioError;

use super::buffer::{AudioFrame, FrameBuffer};
use super::device;
use super::AtomicF32;

/// Samples the feeder keeps queued ahead of the device
const TARGET_QUEUE_SAMPLES: usize = FRAMES_PER_BUFFER * 2;

pub struct AudioPlayback {
    device_name: String,
    running: Arc<AtomicBool>,
    volume: Arc<AtomicF32>,
    muted: Arc<AtomicBool>,
    source: Arc<FrameBuffer<AudioFrame>>,
    worker: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    periods_played: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
    silence_periods: Arc<AtomicU64>,
}

impl AudioPlayback {
    pub fn new(device_name: &str, source: Arc<FrameBuffer<AudioFrame>>) -> Self {
        Self {
            device_name: device_name.to_string(),
            running: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(AtomicF32::new(1.0)),
            muted: Arc::new(AtomicBool::new(false)),
            source,
            worker: None,
            error_rx: None,
            periods_played: Arc::new(AtomicU64::new(0)),
            underruns: Arc::new(AtomicU64::new(0)),
            silence_periods: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the device and spawn the playback worker
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }

        let device = device::find_output_device(&self.device_name)?;
        device::report_negotiated_rate(&device, false);

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let volume = self.volume.clone();
        let muted = self.muted.clone();
        let source = self.source.clone();
        let periods = self.periods_played.clone();
        let underruns = self.underruns.clone();
        let silence = self.silence_periods.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                playback_worker(
                    device, running, volume, muted, source, periods, underruns, silence, error_tx,
                );
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.worker = Some(handle);
        tracing::info!(device = %self.device_name, "audio playback started");
        Ok(())
    }

    /// Stop the worker and release the device
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        tracing::info!("audio playback stopped");
    }

    /// Playback volume in [0, 2]
    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 2.0));
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn periods_played(&self) -> u64 {
        self.periods_played.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Periods synthesized as silence because no frame arrived in time
    pub fn silence_periods(&self) -> u64 {
        self.silence_periods.load(Ordering::Relaxed)
    }

    pub fn take_error(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One feeder step: a frame from the buffer with volume applied, or a
/// zero-filled period when the bounded wait expires
fn next_period(
    source: &FrameBuffer<AudioFrame>,
    volume: f32,
    muted: bool,
    silence: &AtomicU64,
) -> Vec<i16> {
    match source.pop_wait() {
        Some(frame) => {
            let mut samples = frame.samples;
            apply_volume(&mut samples, volume, muted);
            samples
        }
        None => {
            silence.fetch_add(1, Ordering::Relaxed);
            vec![0i16; FRAMES_PER_BUFFER]
        }
    }
}

fn apply_volume(samples: &mut [i16], volume: f32, muted: bool) {
    if muted {
        samples.fill(0);
        return;
    }
    if (volume - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = (*sample as f32 * volume).clamp(-32768.0, 32767.0);
        *sample = scaled as i16;
    }
}

#[allow(clippy::too_many_arguments)]
fn playback_worker(
    device: cpal::Device,
    running: Arc<AtomicBool>,
    volume: Arc<AtomicF32>,
    muted: Arc<AtomicBool>,
    source: Arc<FrameBuffer<AudioFrame>>,
    periods: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
    silence: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
) {
    let queue: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));

    let callback_queue = queue.clone();
    let callback_underruns = underruns.clone();
    let callback_periods = periods.clone();
    let stream_error_tx = error_tx.clone();

    let stream = device.build_output_stream(
        &device::canonical_config(),
        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
            let mut queue = callback_queue.lock();
            let mut missing = 0usize;
            for sample in data.iter_mut() {
                match queue.pop_front() {
                    Some(s) => *sample = s,
                    None => {
                        *sample = 0;
                        missing += 1;
                    }
                }
            }
            if missing > 0 {
                callback_underruns.fetch_add(1, Ordering::Relaxed);
            }
            callback_periods.fetch_add(1, Ordering::Relaxed);
        },
        move |err| {
            let _ = stream_error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("failed to build playback stream: {e}");
            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    if let Err(e) = stream.play() {
        tracing::error!("failed to start playback stream: {e}");
        let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
        running.store(false, Ordering::SeqCst);
        return;
    }

    // Feeder loop: keep roughly two periods queued, block briefly on the
    // jitter buffer, fall through to silence when starved.
    while running.load(Ordering::Relaxed) {
        if queue.lock().len() >= TARGET_QUEUE_SAMPLES {
            thread::sleep(Duration::from_millis(2));
            continue;
        }

        let period = next_period(&source, volume.load(), muted.load(Ordering::Relaxed), &silence);
        queue.lock().extend(period);
    }

    drop(stream);
}
