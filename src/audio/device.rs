//! Audio device lookup and stream configuration

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use serde::Serialize;

use crate::error::AudioError;

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
        }
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Best input configuration for capturing at `target_rate`
    pub fn input_config(&self, target_rate: u32) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let configs: Vec<_> = self
            .inner
            .supported_input_configs()
            .map_err(map_configs_error)?
            .collect();
        select_config(&configs, target_rate)
    }

    /// Best output configuration for playing at `target_rate`
    pub fn output_config(&self, target_rate: u32) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let configs: Vec<_> = self
            .inner
            .supported_output_configs()
            .map_err(map_configs_error)?
            .collect();
        select_config(&configs, target_rate)
    }
}

fn map_configs_error(e: cpal::SupportedStreamConfigsError) -> AudioError {
    match e {
        cpal::SupportedStreamConfigsError::DeviceNotAvailable => {
            AudioError::DeviceNotFound("device no longer available".to_string())
        }
        other => AudioError::UnsupportedFormat(other.to_string()),
    }
}

/// Map a stream build failure. Hosts report a refused microphone
/// permission as a backend error.
pub fn map_build_error(e: cpal::BuildStreamError) -> AudioError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceNotFound("device no longer available".to_string())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            AudioError::UnsupportedFormat("stream configuration not supported".to_string())
        }
        cpal::BuildStreamError::BackendSpecific { err } => {
            let text = err.description.to_lowercase();
            if text.contains("permission") || text.contains("denied") || text.contains("not authorized") {
                AudioError::AccessDenied(err.description)
            } else {
                AudioError::StreamError(err.description)
            }
        }
        other => AudioError::StreamError(other.to_string()),
    }
}

/// Pick a configuration: exact rate with f32 first, then any f32 or i16
/// range, nearest rate.
pub fn select_config(
    configs: &[SupportedStreamConfigRange],
    target_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target = cpal::SampleRate(target_rate);
    let usable = |c: &&SupportedStreamConfigRange| {
        matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
    };
    let covers = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target && c.max_sample_rate() >= target
    };

    let best = configs
        .iter()
        .filter(usable)
        .find(|c| covers(c) && c.sample_format() == SampleFormat::F32)
        .or_else(|| configs.iter().filter(usable).find(|c| covers(c)))
        .or_else(|| configs.iter().find(|c| c.sample_format() == SampleFormat::F32))
        .or_else(|| configs.iter().find(usable));

    let Some(range) = best else {
        return Err(AudioError::UnsupportedFormat(
            "no f32 or i16 stream configuration".to_string(),
        ));
    };

    let rate = if covers(range) {
        target
    } else if range.max_sample_rate() < target {
        range.max_sample_rate()
    } else {
        range.min_sample_rate()
    };

    let format = range.sample_format();
    Ok((range.clone().with_sample_rate(rate).config(), format))
}

/// Device summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
}

/// List input and output devices of the default host
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for name in inputs.filter_map(|d| d.name().ok()) {
            devices.push(DeviceInfo {
                is_default: default_input.as_ref() == Some(&name),
                name,
                is_input: true,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for name in outputs.filter_map(|d| d.name().ok()) {
            devices.push(DeviceInfo {
                is_default: default_output.as_ref() == Some(&name),
                name,
                is_input: false,
            });
        }
    }

    devices
}

/// Input device by name, or the default one
pub fn input_device(name: Option<&str>) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
    }
}

/// Get default output device
pub fn default_output_device() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_output_device()
        .map(AudioDevice::from_cpal)
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleRate, SupportedBufferSize};

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_prefers_f32_at_target_rate() {
        let configs = vec![
            range(2, 44100, 44100, SampleFormat::F32),
            range(1, 8000, 96000, SampleFormat::I16),
            range(2, 8000, 96000, SampleFormat::F32),
        ];
        let (config, format) = select_config(&configs, 48000).unwrap();
        assert_eq!(format, SampleFormat::F32);
        assert_eq!(config.sample_rate.0, 48000);
        assert_eq!(config.channels, 2);
    }

    #[test]
    fn test_falls_back_to_nearest_rate() {
        let configs = vec![range(2, 44100, 44100, SampleFormat::F32)];
        let (config, _) = select_config(&configs, 48000).unwrap();
        assert_eq!(config.sample_rate.0, 44100);
    }

    #[test]
    fn test_rejects_unusable_formats() {
        let configs = vec![range(2, 48000, 48000, SampleFormat::U8)];
        assert!(matches!(
            select_config(&configs, 48000),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }
}
