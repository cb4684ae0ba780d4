//! Audio device selection
//!
//! Thin layer over cpal: pick a device by name ("default" selects the host
//! default) and derive the stream configuration for the canonical format.

use cpal::traits::{DeviceTrait, HostTrait};

use crate::constants::{FRAMES_PER_BUFFER, SAMPLE_RATE};
use crate::error::AudioError;

/// Name that selects the host default device
pub const DEFAULT_DEVICE: &str = "default";

/// Find an input device by name
pub fn find_input_device(name: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    if name == DEFAULT_DEVICE {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no default input device".to_string()));
    }

    let devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Find an output device by name
pub fn find_output_device(name: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    if name == DEFAULT_DEVICE {
        return host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no default output device".to_string()));
    }

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Stream configuration for the canonical capture/playback format
pub fn canonical_config() -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: crate::constants::CHANNELS,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Fixed(FRAMES_PER_BUFFER as u32),
    }
}

/// Rate the device would pick on its own, for the startup report
///
/// The pipeline stays bound to the canonical 48 kHz either way; a deviating
/// device rate is logged and handled by resampling.
pub fn report_negotiated_rate(device: &cpal::Device, input: bool) -> Option<u32> {
    let rate = if input {
        device.default_input_config().ok()?.sample_rate().0
    } else {
        device.default_output_config().ok()?.sample_rate().0
    };
    if rate != SAMPLE_RATE {
        tracing::info!(
            requested = SAMPLE_RATE,
            achieved = rate,
            "device prefers a different sample rate"
        );
    }
    Some(rate)
}

/// Log the available devices at startup
pub fn log_available_devices() {
    let host = cpal::default_host();

    if let Ok(devices) = host.input_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                tracing::info!(device = %name, "input device available");
            }
        }
    }
    if let Ok(devices) = host.output_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                tracing::info!(device = %name, "output device available");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_config_shape() {
        let config = canonical_config();
        assert_eq!(config.channels, 1);
        assert_eq!(config.sample_rate.0, 48_000);
    }

    #[test]
    fn unknown_device_is_an_error() {
        // Device enumeration itself may fail on headless CI; only assert
        // when the host can enumerate at all.
        if cpal::default_host().input_devices().is_ok() {
            assert!(find_input_device("no-such-device-exists").is_err());
        }
    }
}
