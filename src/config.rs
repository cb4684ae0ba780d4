//! Session and preprocessing configuration

use std::net::{IpAddr, SocketAddr};

use crate::constants::{DEFAULT_BITRATE, MAX_BITRATE, MIN_BITRATE};
use crate::error::{Error, Result};

/// How the transport binds and finds its peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    /// Bind a local port and learn the remote address from incoming datagrams
    Listener { local_port: u16 },
    /// Bind an ephemeral port and send to a fixed remote address
    Initiator { remote: SocketAddr },
    /// Bind a known local port and send to a known remote address
    Peer {
        remote_ip: IpAddr,
        local_port: u16,
        remote_port: u16,
    },
}

impl TransportMode {
    /// Remote address this mode targets, if fixed up front
    pub fn remote(&self) -> Option<SocketAddr> {
        match self {
            TransportMode::Listener { .. } => None,
            TransportMode::Initiator { remote } => Some(*remote),
            TransportMode::Peer {
                remote_ip,
                remote_port,
                ..
            } => Some(SocketAddr::new(*remote_ip, *remote_port)),
        }
    }
}

/// Top-level session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: TransportMode,
    /// Audio device name; "default" selects the host default device
    pub device: String,
    pub preprocess: PreprocessConfig,
}

impl SessionConfig {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            device: "default".to_string(),
            preprocess: PreprocessConfig::default(),
        }
    }
}

/// Preprocessing chain configuration
///
/// All stages default on except echo cancellation, which the pipeline does
/// not implement.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    pub enable_noise_suppression: bool,
    pub enable_codec: bool,
    pub enable_bitrate_adaptation: bool,
    pub enable_vad: bool,
    pub enable_agc: bool,
    pub enable_echo_cancellation: bool,

    /// Suppression strength in [0, 1]
    pub noise_suppression_level: f32,
    /// Speech-probability gate in [0, 1]
    pub vad_threshold: f32,
    /// AGC RMS target in [0.1, 2.0]
    pub agc_target_level: f32,
    /// Initial codec bitrate in bps
    pub target_bitrate: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            enable_noise_suppression: true,
            enable_codec: true,
            enable_bitrate_adaptation: true,
            enable_vad: true,
            enable_agc: true,
            enable_echo_cancellation: false,
            noise_suppression_level: 0.8,
            vad_threshold: 0.5,
            agc_target_level: 0.7,
            target_bitrate: DEFAULT_BITRATE,
        }
    }
}

impl PreprocessConfig {
    /// Lowest processing latency: no denoise, no VAD, maximum bitrate
    pub fn low_latency() -> Self {
        Self {
            enable_noise_suppression: false,
            enable_vad: false,
            noise_suppression_level: 0.5,
            vad_threshold: 0.3,
            agc_target_level: 0.8,
            target_bitrate: MAX_BITRATE,
            ..Self::default()
        }
    }

    /// Everything on, maximum bitrate
    pub fn high_quality() -> Self {
        Self {
            noise_suppression_level: 0.9,
            target_bitrate: MAX_BITRATE,
            ..Self::default()
        }
    }

    /// Everything on except AGC, minimum bitrate
    pub fn power_save() -> Self {
        Self {
            enable_agc: false,
            noise_suppression_level: 0.6,
            vad_threshold: 0.6,
            agc_target_level: 0.5,
            target_bitrate: MIN_BITRATE,
            ..Self::default()
        }
    }

    /// Reject out-of-range values before any component is built
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.noise_suppression_level) {
            return Err(Error::Config(format!(
                "noise suppression level {} outside [0, 1]",
                self.noise_suppression_level
            )));
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(Error::Config(format!(
                "VAD threshold {} outside [0, 1]",
                self.vad_threshold
            )));
        }
        if !(0.1..=2.0).contains(&self.agc_target_level) {
            return Err(Error::Config(format!(
                "AGC target level {} outside [0.1, 2.0]",
                self.agc_target_level
            )));
        }
        if !(MIN_BITRATE..=MAX_BITRATE).contains(&self.target_bitrate) {
            return Err(Error::Config(format!(
                "bitrate {} bps outside [{}, {}]",
                self.target_bitrate, MIN_BITRATE, MAX_BITRATE
            )));
        }
        Ok(())
    }
}
