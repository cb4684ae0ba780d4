//! Opus-backed codec
//!
//! Wraps an Opus encoder/decoder pair tuned for VoIP. The encode buffer is
//! reused across calls to keep the real-time path allocation-free.

use bytes::Bytes;
use opus::{Application, Channels, Decoder, Encoder};

use crate::constants::{MAX_BITRATE, MIN_BITRATE, MAX_PACKET_SIZE};
use crate::error::CodecError;

use super::{validate_codec_params, CodecStats, VoiceCodec};

/// Largest payload a frame may occupy after the 4-byte wire header
const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - 4;

pub struct OpusVoiceCodec {
    encoder: Encoder,
    decoder: Decoder,
    sample_rate: u32,
    frame_size: usize,
    bitrate: u32,
    encode_buffer: Vec<u8>,
    decode_buffer: Vec<i16>,
    stats: CodecStats,
}

impl OpusVoiceCodec {
    pub fn new(sample_rate: u32, channels: u16, bitrate: u32) -> Result<Self, CodecError> {
        let frame_size = validate_codec_params(sample_rate, channels, bitrate)?;

        let mut encoder = Encoder::new(sample_rate, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::Init(format!("failed to set bitrate: {e}")))?;

        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::Init(e.to_string()))?;

        tracing::debug!(sample_rate, bitrate, frame_size, "opus codec ready");

        Ok(Self {
            encoder,
            decoder,
            sample_rate,
            frame_size,
            bitrate,
            encode_buffer: vec![0u8; MAX_PAYLOAD],
            decode_buffer: vec![0i16; frame_size],
            stats: CodecStats::default(),
        })
    }
}

impl VoiceCodec for OpusVoiceCodec {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn bitrate(&self) -> u32 {
        self.bitrate
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        if !(MIN_BITRATE..=MAX_BITRATE).contains(&bitrate) {
            return Err(CodecError::InvalidBitrate(bitrate));
        }
        self.encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::Init(format!("failed to set bitrate: {e}")))?;
        self.bitrate = bitrate;
        Ok(())
    }

    fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        if samples.len() != self.frame_size {
            self.stats.encode_errors += 1;
            return Err(CodecError::InvalidFrameLength {
                got: samples.len(),
                expected: self.frame_size,
            });
        }

        let written = self
            .encoder
            .encode(samples, &mut self.encode_buffer)
            .map_err(|e| {
                self.stats.encode_errors += 1;
                CodecError::EncodingFailed(e.to_string())
            })?;

        self.stats.encoded_frames += 1;
        Ok(Bytes::copy_from_slice(&self.encode_buffer[..written]))
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        if payload.is_empty() {
            self.stats.decode_errors += 1;
            return Err(CodecError::DecodingFailed("empty payload".to_string()));
        }

        let decoded = self
            .decoder
            .decode(payload, &mut self.decode_buffer, false)
            .map_err(|e| {
                self.stats.decode_errors += 1;
                CodecError::DecodingFailed(e.to_string())
            })?;

        self.stats.decoded_frames += 1;
        Ok(self.decode_buffer[..decoded].to_vec())
    }

    fn stats(&self) -> CodecStats {
        self.stats
    }
}
