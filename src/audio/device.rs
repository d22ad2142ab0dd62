//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::constants::SAMPLE_RATE;
use crate::error::AudioError;

/// Device description for listings and diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    /// Whether the device accepts the relay rate natively
    pub supports_relay_rate: bool,
    pub channels: Vec<u16>,
}

/// Direction a device is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn prefix(self) -> &'static str {
        match self {
            Direction::Input => "input:",
            Direction::Output => "output:",
        }
    }
}

/// Wrapper around a cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub direction: Direction,
}

impl AudioDevice {
    fn from_cpal(device: cpal::Device, direction: Direction) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
            direction,
        }
    }

    pub fn id(&self) -> String {
        format!("{}{}", self.direction.prefix(), self.name)
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Native configuration for the device's direction
    pub fn default_config(&self) -> Result<cpal::SupportedStreamConfig, AudioError> {
        let config = match self.direction {
            Direction::Input => self.inner.default_input_config()?,
            Direction::Output => self.inner.default_output_config()?,
        };
        Ok(config)
    }
}

fn capabilities(device: &cpal::Device, direction: Direction) -> (bool, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|c| c.collect()),
        Direction::Output => device.supported_output_configs().map(|c| c.collect()),
    }
    .unwrap_or_default();

    let rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_relay_rate = configs
        .iter()
        .any(|c| rate >= c.min_sample_rate() && rate <= c.max_sample_rate());

    let mut channels: Vec<u16> = configs.iter().map(|c| c.channels()).collect();
    channels.sort_unstable();
    channels.dedup();

    (supports_relay_rate, channels)
}

/// List input and output devices of the default host
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let sources = [
        (
            Direction::Input,
            host.input_devices().ok().map(|d| d.collect::<Vec<_>>()),
            default_input,
        ),
        (
            Direction::Output,
            host.output_devices().ok().map(|d| d.collect::<Vec<_>>()),
            default_output,
        ),
    ];

    for (direction, iter, default_name) in sources {
        let Some(iter) = iter else { continue };
        for device in iter {
            let Ok(name) = device.name() else { continue };
            let (supports_relay_rate, channels) = capabilities(&device, direction);
            devices.push(AudioDeviceInfo {
                id: format!("{}{}", direction.prefix(), name),
                is_default: default_name.as_ref() == Some(&name),
                name,
                is_input: direction == Direction::Input,
                is_output: direction == Direction::Output,
                supports_relay_rate,
                channels,
            });
        }
    }

    devices
}

/// Find a device by id (`input:<name>` / `output:<name>`) or bare name, or
/// fall back to the host default when `id` is `None`
pub fn find_device(direction: Direction, id: Option<&str>) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device
            .map(|d| AudioDevice::from_cpal(d, direction))
            .ok_or_else(|| AudioError::DeviceNotFound(format!("No default {:?} device", direction)));
    };

    let name = id.strip_prefix(direction.prefix()).unwrap_or(id);
    let devices: Vec<cpal::Device> = match direction {
        Direction::Input => host.input_devices().map(|d| d.collect()),
        Direction::Output => host.output_devices().map(|d| d.collect()),
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    devices
        .into_iter()
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .map(|d| AudioDevice::from_cpal(d, direction))
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_device_not_found() {
        let result = find_device(Direction::Output, Some("output:definitely-not-a-device"));
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    }

    #[test]
    fn test_listing_ids_are_prefixed() {
        // Hosts without audio hardware simply list nothing
        for device in list_devices() {
            assert!(device.id.starts_with("input:") || device.id.starts_with("output:"));
            assert!(device.is_input != device.is_output);
        }
    }
}
