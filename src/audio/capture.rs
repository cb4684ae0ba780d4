//! Microphone capture worker
//!
//! The cpal stream callback hands raw periods to a lock-free ring; a
//! dedicated worker thread drains it, applies the capture gain, slices the
//! stream into 20 ms codec frames and runs them through the preprocessor
//! before pushing the encoded result into the transmit queue. Heavy work
//! never runs on the device callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::codec::EncodedPacket;
use crate::constants::{DEVICE_FRAME_SIZE, FRAMES_PER_BUFFER};
use crate::error::AudioError;

use super::buffer::FrameBuffer;
use super::device;
use super::preprocess::Preprocessor;
use super::AtomicF32;

/// Periods the callback may buffer ahead of the worker
const PERIOD_RING_CAPACITY: usize = 16;

pub struct AudioCapture {
    device_name: String,
    running: Arc<AtomicBool>,
    gain: Arc<AtomicF32>,
    sink: Arc<FrameBuffer<EncodedPacket>>,
    preprocessor: Arc<Preprocessor>,
    worker: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    periods_captured: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
}

impl AudioCapture {
    pub fn new(
        device_name: &str,
        sink: Arc<FrameBuffer<EncodedPacket>>,
        preprocessor: Arc<Preprocessor>,
    ) -> Self {
        Self {
            device_name: device_name.to_string(),
            running: Arc::new(AtomicBool::new(false)),
            gain: Arc::new(AtomicF32::new(1.0)),
            sink,
            preprocessor,
            worker: None,
            error_rx: None,
            periods_captured: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the device and spawn the capture worker
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }

        let device = device::find_input_device(&self.device_name)?;
        device::report_negotiated_rate(&device, true);

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let gain = self.gain.clone();
        let sink = self.sink.clone();
        let preprocessor = self.preprocessor.clone();
        let periods = self.periods_captured.clone();
        let overruns = self.overruns.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                capture_worker(
                    device,
                    running,
                    gain,
                    sink,
                    preprocessor,
                    periods,
                    overruns,
                    error_tx,
                );
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.worker = Some(handle);
        tracing::info!(device = %self.device_name, "audio capture started");
        Ok(())
    }

    /// Stop the worker and release the device
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        tracing::info!("audio capture stopped");
    }

    /// Capture gain in [0, 2]
    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.clamp(0.0, 2.0));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn periods_captured(&self) -> u64 {
        self.periods_captured.load(Ordering::Relaxed)
    }

    /// Periods lost because the worker fell behind the device
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Fatal device error, if the worker reported one
    pub fn take_error(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_worker(
    device: cpal::Device,
    running: Arc<AtomicBool>,
    gain: Arc<AtomicF32>,
    sink: Arc<FrameBuffer<EncodedPacket>>,
    preprocessor: Arc<Preprocessor>,
    periods: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
) {
    let ring: Arc<ArrayQueue<Vec<i16>>> = Arc::new(ArrayQueue::new(PERIOD_RING_CAPACITY));

    let callback_ring = ring.clone();
    let callback_running = running.clone();
    let callback_overruns = overruns.clone();
    let stream_error_tx = error_tx.clone();

    let stream = device.build_input_stream(
        &device::canonical_config(),
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            if !callback_running.load(Ordering::Relaxed) {
                return;
            }
            if callback_ring.push(data.to_vec()).is_err() {
                callback_overruns.fetch_add(1, Ordering::Relaxed);
            }
        },
        move |err| {
            let _ = stream_error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("failed to build capture stream: {e}");
            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    if let Err(e) = stream.play() {
        tracing::error!("failed to start capture stream: {e}");
        let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
        running.store(false, Ordering::SeqCst);
        return;
    }

    // Worker loop: drain periods, gain, chunk, encode, enqueue.
    let mut pending: Vec<i16> = Vec::with_capacity(FRAMES_PER_BUFFER * 2);
    while running.load(Ordering::Relaxed) {
        let Some(mut period) = ring.pop() else {
            thread::sleep(Duration::from_millis(2));
            continue;
        };

        periods.fetch_add(1, Ordering::Relaxed);
        apply_gain(&mut period, gain.load());
        pending.extend_from_slice(&period);

        while pending.len() >= DEVICE_FRAME_SIZE {
            let frame: Vec<i16> = pending.drain(..DEVICE_FRAME_SIZE).collect();
            match preprocessor.encode_frame(&frame) {
                Ok(packet) => {
                    sink.push(packet);
                }
                Err(e) => {
                    // Drop the frame and keep the pipeline moving.
                    tracing::warn!("encode failed: {e}");
                }
            }
        }
    }

    // Dropping the stream releases the device and unblocks its callback.
    drop(stream);
}

/// Scale S16 samples with clipping protection
fn apply_gain(samples: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = (*sample as f32 * gain).clamp(-32768.0, 32767.0);
        *sample = scaled as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreprocessConfig;

    #[test]
    fn gain_scales_and_clips() {
        let mut samples = vec![1000i16, -1000, 30000, -30000];
        apply_gain(&mut samples, 2.0);
        assert_eq!(samples, vec![2000, -2000, 32767, -32768]);
    }

    #[test]
    fn unit_gain_is_untouched() {
        let mut samples = vec![123i16, -456];
        apply_gain(&mut samples, 1.0);
        assert_eq!(samples, vec![123, -456]);
    }

    #[test]
    fn gain_setter_clamps() {
        let sink = Arc::new(FrameBuffer::new(4));
        let preprocessor = Arc::new(
            Preprocessor::new(PreprocessConfig {
                enable_codec: false,
                enable_noise_suppression: false,
                enable_bitrate_adaptation: false,
                enable_vad: false,
                enable_agc: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let capture = AudioCapture::new("default", sink, preprocessor);
        capture.set_gain(5.0);
        assert_eq!(capture.gain.load(), 2.0);
        capture.set_gain(-1.0);
        assert_eq!(capture.gain.load(), 0.0);
    }
}
