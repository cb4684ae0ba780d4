//! Raw-PCM pass-through codec
//!
//! Preserves the codec interface without compressing: the payload is the
//! little-endian byte view of the samples. Used when compression is
//! disabled, and as the fallback when no real codec is available.

use bytes::Bytes;

use crate::constants::{MAX_BITRATE, MIN_BITRATE};
use crate::error::CodecError;

use super::{validate_codec_params, CodecStats, VoiceCodec};

pub struct PassthroughCodec {
    sample_rate: u32,
    frame_size: usize,
    bitrate: u32,
    stats: CodecStats,
}

impl PassthroughCodec {
    pub fn new(sample_rate: u32, channels: u16, bitrate: u32) -> Result<Self, CodecError> {
        let frame_size = validate_codec_params(sample_rate, channels, bitrate)?;
        Ok(Self {
            sample_rate,
            frame_size,
            bitrate,
            stats: CodecStats::default(),
        })
    }
}

impl VoiceCodec for PassthroughCodec {
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

        let mut payload = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            payload.extend_from_slice(&sample.to_le_bytes());
        }

        self.stats.encoded_frames += 1;
        Ok(Bytes::from(payload))
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        if payload.is_empty() || payload.len() % 2 != 0 {
            self.stats.decode_errors += 1;
            return Err(CodecError::DecodingFailed(format!(
                "payload of {} bytes is not a whole number of samples",
                payload.len()
            )));
        }

        let samples: Vec<i16> = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        self.stats.decoded_frames += 1;
        Ok(samples)
    }

    fn stats(&self) -> CodecStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CODEC_FRAME_SIZE;

    #[test]
    fn roundtrip_is_exact() {
        let mut codec = PassthroughCodec::new(16_000, 1, 6000).unwrap();
        let frame: Vec<i16> = (0..CODEC_FRAME_SIZE as i16).map(|i| i * 17 - 3000).collect();

        let payload = codec.encode(&frame).unwrap();
        assert_eq!(payload.len(), CODEC_FRAME_SIZE * 2);

        let decoded = codec.decode(&payload).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn wrong_length_fails_without_consumption() {
        let mut codec = PassthroughCodec::new(16_000, 1, 6000).unwrap();
        assert!(codec.encode(&vec![0i16; 100]).is_err());
        assert_eq!(codec.stats().encode_errors, 1);
        assert_eq!(codec.stats().encoded_frames, 0);
    }

    #[test]
    fn odd_payload_rejected() {
        let mut codec = PassthroughCodec::new(16_000, 1, 6000).unwrap();
        assert!(codec.decode(&[1, 2, 3]).is_err());
        assert_eq!(codec.stats().decode_errors, 1);
    }

    #[test]
    fn little_endian_byte_view() {
        let mut codec = PassthroughCodec::new(16_000, 1, 6000).unwrap();
        let mut frame = vec![0i16; CODEC_FRAME_SIZE];
        frame[0] = 0x1234;
        let payload = codec.encode(&frame).unwrap();
        assert_eq!(&payload[..2], &[0x34, 0x12]);
    }

    #[test]
    fn bitrate_stored_but_inert() {
        let mut codec = PassthroughCodec::new(16_000, 1, 3200).unwrap();
        codec.set_bitrate(9200).unwrap();
        assert_eq!(codec.bitrate(), 9200);
    }
}
