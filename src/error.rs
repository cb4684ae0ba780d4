//! Error types for the voice endpoint

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("Worker already running")]
    AlreadyRunning,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec initialization failed: {0}")]
    Init(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame length: {got} samples (expected {expected})")]
    InvalidFrameLength { got: usize, expected: usize },

    #[error("Bitrate {0} bps outside supported range")]
    InvalidBitrate(u32),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Partial send: {sent}/{len} bytes")]
    PartialSend { sent: usize, len: usize },

    #[error("No remote address set")]
    NoRemote,

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Transport not running")]
    NotRunning,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
