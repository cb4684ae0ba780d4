//! # voicelink
//!
//! Low-latency peer-to-peer voice calls over UDP.
//!
//! Each endpoint runs the full pipeline in both directions: microphone
//! capture, preprocessing (AGC, noise suppression, voice activity
//! detection), speech coding at an adaptively chosen bitrate, and datagram
//! transport — plus the mirror image for received audio. Two endpoints
//! talk directly to each other; there is no server.
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌────────────┐   ┌──────────────────────────────┐   ┌─────────────┐
//!  │ Microphone │──▶│ Preprocessor                  │──▶│ FrameBuffer │──┐
//!  │ (capture)  │   │  AGC ▸ denoise ▸ VAD ▸ encode │   │   (tx)      │  │
//!  └────────────┘   └──────────────┬───────────────┘   └─────────────┘  │
//!                                  │                                     ▼
//!                          ┌───────┴────────┐                     ┌────────────┐
//!                          │ BitrateControl │◀── loss / latency ──│ UdpTransport│══▶ peer
//!                          └───────┬────────┘                     └────────────┘
//!                                  │                                     │
//!  ┌────────────┐   ┌──────────────┴───────────────┐   ┌─────────────┐  │
//!  │  Speaker   │◀──│ Preprocessor                  │◀──│ FrameBuffer │◀─┘
//!  │ (playback) │   │  decode ▸ resample ▸ volume   │   │   (rx)      │
//!  └────────────┘   └──────────────────────────────┘   └─────────────┘
//! ```
//!
//! Frames move through bounded drop-oldest queues: for live voice a fresh
//! frame is always worth more than a stale one. Every drop, failed send,
//! overrun and underrun is counted and visible in the session statistics.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Canonical device sample rate (the denoiser requires 48 kHz)
    pub const SAMPLE_RATE: u32 = 48_000;

    /// Mono throughout the pipeline
    pub const CHANNELS: u16 = 1;

    /// Device period size in frames
    pub const FRAMES_PER_BUFFER: usize = 1024;

    /// Codec-internal sample rate
    pub const CODEC_SAMPLE_RATE: u32 = 16_000;

    /// Codec work unit duration
    pub const CODEC_FRAME_MS: u32 = 20;

    /// Codec work unit in samples at the codec rate (20 ms @ 16 kHz)
    pub const CODEC_FRAME_SIZE: usize =
        (CODEC_SAMPLE_RATE as usize * CODEC_FRAME_MS as usize) / 1000;

    /// Codec work unit in samples at the device rate (20 ms @ 48 kHz)
    pub const DEVICE_FRAME_SIZE: usize =
        (SAMPLE_RATE as usize * CODEC_FRAME_MS as usize) / 1000;

    /// Denoiser work unit in samples (10 ms @ 48 kHz)
    pub const DENOISE_FRAME_SIZE: usize = 480;

    /// Lowest supported codec bitrate in bps
    pub const MIN_BITRATE: u32 = 3200;

    /// Highest supported codec bitrate in bps
    pub const MAX_BITRATE: u32 = 9200;

    /// Startup codec bitrate in bps
    pub const DEFAULT_BITRATE: u32 = 6000;

    /// Maximum UDP datagram size in bytes
    pub const MAX_PACKET_SIZE: usize = 1024;

    /// Frame queue capacity per direction
    pub const BUFFER_CAPACITY: usize = 10;

    /// Bounded wait for the playback/sender pop in milliseconds
    pub const POP_TIMEOUT_MS: u64 = 10;

    /// Default UDP port for the classic server/client modes
    pub const DEFAULT_PORT: u16 = 8888;
}
