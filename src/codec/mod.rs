//! Speech codec capability
//!
//! The pipeline talks to a [`VoiceCodec`] trait object and never cares which
//! implementation is behind it: [`opus::OpusVoiceCodec`] when compression is
//! enabled, [`passthrough::PassthroughCodec`] when it is not. Both operate
//! on 20 ms mono frames and share the packet format.

pub mod bitrate;
pub mod opus;
pub mod passthrough;

use std::time::Instant;

use bytes::Bytes;

use crate::config::PreprocessConfig;
use crate::constants::{CODEC_FRAME_MS, MAX_BITRATE, MIN_BITRATE};
use crate::error::CodecError;

pub use bitrate::{AudioMetrics, BitrateController, NetworkMetrics, QualityMode};
pub use opus::OpusVoiceCodec;
pub use passthrough::PassthroughCodec;

/// A compressed 20 ms frame ready for the wire
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub payload: Bytes,
    pub sequence: u32,
    /// Bitrate in effect when this frame was encoded
    pub bitrate: u32,
    pub timestamp: Instant,
}

impl EncodedPacket {
    pub fn new(payload: Bytes, sequence: u32, bitrate: u32) -> Self {
        Self {
            payload,
            sequence,
            bitrate,
            timestamp: Instant::now(),
        }
    }
}

/// Frame-synchronous codec operations
///
/// Implementations are not thread-safe; the preprocessor serializes access.
pub trait VoiceCodec: Send {
    /// Samples per 20 ms frame at the codec rate
    fn frame_size(&self) -> usize;

    /// Codec-internal sample rate in Hz
    fn sample_rate(&self) -> u32;

    /// Bitrate currently applied to encoding
    fn bitrate(&self) -> u32;

    /// Change the bitrate; takes effect on the next encode call
    fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError>;

    /// Compress exactly one frame of mono S16LE samples
    fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError>;

    /// Decompress one payload back to PCM at the codec rate
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError>;

    /// Lifetime frame and error counters
    fn stats(&self) -> CodecStats;
}

/// Codec frame/error counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecStats {
    pub encoded_frames: u64,
    pub decoded_frames: u64,
    pub encode_errors: u64,
    pub decode_errors: u64,
}

/// Build the codec selected by the configuration
pub fn build_codec(config: &PreprocessConfig) -> Result<Box<dyn VoiceCodec>, CodecError> {
    if config.enable_codec {
        Ok(Box::new(OpusVoiceCodec::new(
            crate::constants::CODEC_SAMPLE_RATE,
            1,
            config.target_bitrate,
        )?))
    } else {
        Ok(Box::new(PassthroughCodec::new(
            crate::constants::CODEC_SAMPLE_RATE,
            1,
            config.target_bitrate,
        )?))
    }
}

/// Shared parameter validation for both codec variants
pub(crate) fn validate_codec_params(
    sample_rate: u32,
    channels: u16,
    bitrate: u32,
) -> Result<usize, CodecError> {
    if channels != 1 {
        return Err(CodecError::Init(format!(
            "only mono is supported, got {channels} channels"
        )));
    }
    if !matches!(sample_rate, 16_000 | 32_000 | 48_000) {
        return Err(CodecError::Init(format!(
            "unsupported sample rate {sample_rate} Hz"
        )));
    }
    if !(MIN_BITRATE..=MAX_BITRATE).contains(&bitrate) {
        return Err(CodecError::InvalidBitrate(bitrate));
    }
    Ok((sample_rate as usize * CODEC_FRAME_MS as usize) / 1000)
}

/// Linear-interpolation sample rate conversion
///
/// Sufficient for the speech band; both directions of the 48↔16 kHz hop go
/// through here.
pub fn resample_linear(input: &[i16], input_rate: u32, output_rate: u32) -> Vec<i16> {
    if input_rate == output_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = output_rate as f32 / input_rate as f32;
    let output_len = (input.len() as f32 * ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let source = i as f32 / ratio;
        let index = source as usize;
        if index >= input.len() - 1 {
            output.push(input[input.len() - 1]);
        } else {
            let fraction = source - index as f32;
            let sample =
                input[index] as f32 * (1.0 - fraction) + input[index + 1] as f32 * fraction;
            output.push(sample as i16);
        }
    }

    output
}

/// Resample from an arbitrary source rate to the codec rate
pub fn resample_to_16k(input: &[i16], source_rate: u32) -> Vec<i16> {
    resample_linear(input, source_rate, crate::constants::CODEC_SAMPLE_RATE)
}

/// Resample from the codec rate to an arbitrary target rate
pub fn resample_from_16k(input: &[i16], target_rate: u32) -> Vec<i16> {
    resample_linear(input, crate::constants::CODEC_SAMPLE_RATE, target_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CODEC_FRAME_SIZE, DEVICE_FRAME_SIZE};

    #[test]
    fn validate_rejects_bad_params() {
        assert!(validate_codec_params(44_100, 1, 6000).is_err());
        assert!(validate_codec_params(16_000, 2, 6000).is_err());
        assert!(validate_codec_params(16_000, 1, 3199).is_err());
        assert!(validate_codec_params(16_000, 1, 9201).is_err());
    }

    #[test]
    fn validate_derives_frame_size() {
        assert_eq!(validate_codec_params(16_000, 1, 6000).unwrap(), 320);
        assert_eq!(validate_codec_params(48_000, 1, 6000).unwrap(), 960);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let input: Vec<i16> = (0..960).map(|i| i as i16).collect();
        assert_eq!(resample_linear(&input, 48_000, 48_000), input);
    }

    #[test]
    fn resample_48k_to_16k_length() {
        let input = vec![0i16; DEVICE_FRAME_SIZE];
        let output = resample_to_16k(&input, 48_000);
        assert_eq!(output.len(), CODEC_FRAME_SIZE);
    }

    #[test]
    fn resample_16k_to_48k_length() {
        let input = vec![0i16; CODEC_FRAME_SIZE];
        let output = resample_from_16k(&input, 48_000);
        assert_eq!(output.len(), DEVICE_FRAME_SIZE);
    }

    #[test]
    fn resample_preserves_constant_signal() {
        let input = vec![1000i16; DEVICE_FRAME_SIZE];
        let output = resample_to_16k(&input, 48_000);
        assert!(output.iter().all(|&s| (s - 1000).abs() <= 1));
    }

    #[test]
    fn build_codec_honors_enable_flag() {
        let mut config = PreprocessConfig::default();
        config.enable_codec = false;
        let codec = build_codec(&config).unwrap();
        // Pass-through emits the raw byte view: 2 bytes per sample.
        assert_eq!(codec.frame_size(), CODEC_FRAME_SIZE);

        config.enable_codec = true;
        let codec = build_codec(&config).unwrap();
        assert_eq!(codec.frame_size(), CODEC_FRAME_SIZE);
        assert_eq!(codec.sample_rate(), 16_000);
    }
}
