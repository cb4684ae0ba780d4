//! Audio subsystem: capture, playback, buffering and preprocessing

pub mod buffer;
pub mod capture;
pub mod device;
pub mod noise;
pub mod playback;
pub mod preprocess;

pub use buffer::{AudioFrame, FrameBuffer};
pub use capture::AudioCapture;
pub use noise::{NoiseMetrics, NoiseSuppressor};
pub use playback::AudioPlayback;
pub use preprocess::{Preprocessor, PreprocessStats};

use std::sync::atomic::{AtomicU32, Ordering};

/// An `f32` stored as atomic bits
///
/// Gain and volume scalars are written from control paths and read on every
/// audio period; a lock would be overkill for a single word.
pub(crate) struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::AtomicF32;

    #[test]
    fn atomic_f32_roundtrip() {
        let value = AtomicF32::new(1.0);
        assert_eq!(value.load(), 1.0);
        value.store(0.37);
        assert_eq!(value.load(), 0.37);
    }
}
