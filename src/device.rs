//! Audio device enumeration and lookup.
//!
//! Devices are identified by name, as cpal reports them. The id `"default"`
//! always resolves to the host's default device.

use rodio::cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEVICE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

impl DeviceInfo {
    fn system_default() -> Self {
        DeviceInfo {
            id: DEFAULT_DEVICE.into(),
            name: "System default".into(),
            is_default: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

pub trait DeviceDirectory: Send + Sync {
    fn list(&self, direction: Direction) -> Vec<DeviceInfo>;

    /// `None` and `"default"` are always valid.
    fn contains(&self, direction: Direction, id: Option<&str>) -> bool {
        match id {
            None | Some(DEFAULT_DEVICE) => true,
            Some(id) => self.list(direction).iter().any(|d| d.id == id),
        }
    }
}

/// The host's real devices, via cpal.
pub struct SystemDevices;

impl DeviceDirectory for SystemDevices {
    fn list(&self, direction: Direction) -> Vec<DeviceInfo> {
        let host = rodio::cpal::default_host();
        let (devices, default_name) = match direction {
            Direction::Output => (
                host.output_devices().map(|d| d.collect::<Vec<_>>()),
                host.default_output_device().and_then(|d| d.name().ok()),
            ),
            Direction::Input => (
                host.input_devices().map(|d| d.collect::<Vec<_>>()),
                host.default_input_device().and_then(|d| d.name().ok()),
            ),
        };

        let mut out = vec![DeviceInfo::system_default()];
        for device in devices.unwrap_or_default() {
            if let Ok(name) = device.name() {
                if out.iter().any(|d| d.id == name) {
                    continue;
                }
                out.push(DeviceInfo {
                    is_default: default_name.as_ref() == Some(&name),
                    id: name.clone(),
                    name,
                });
            }
        }
        out
    }
}

/// A fixed device list, for offline engines and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDevices {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl StaticDevices {
    pub fn new(inputs: &[&str], outputs: &[&str]) -> Self {
        StaticDevices {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DeviceDirectory for StaticDevices {
    fn list(&self, direction: Direction) -> Vec<DeviceInfo> {
        let names = match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        };
        std::iter::once(DeviceInfo::system_default())
            .chain(names.iter().map(|n| DeviceInfo {
                id: n.clone(),
                name: n.clone(),
                is_default: false,
            }))
            .collect()
    }
}

/// Open a cpal output device by id.
pub fn find_output_device(id: Option<&str>) -> Result<rodio::Device, String> {
    let host = rodio::cpal::default_host();
    match id {
        None | Some(DEFAULT_DEVICE) => host
            .default_output_device()
            .ok_or_else(|| "no default output device".to_string()),
        Some(id) => host
            .output_devices()
            .map_err(|e| format!("cannot enumerate outputs: {}", e))?
            .find(|d| d.name().is_ok_and(|n| n == id))
            .ok_or_else(|| format!("output device '{}' not found", id)),
    }
}

/// Open a cpal input device by id.
pub fn find_input_device(id: Option<&str>) -> Result<rodio::Device, String> {
    let host = rodio::cpal::default_host();
    match id {
        None | Some(DEFAULT_DEVICE) => host
            .default_input_device()
            .ok_or_else(|| "no default input device".to_string()),
        Some(id) => host
            .input_devices()
            .map_err(|e| format!("cannot enumerate inputs: {}", e))?
            .find(|d| d.name().is_ok_and(|n| n == id))
            .ok_or_else(|| format!("input device '{}' not found", id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_always_listed_first() {
        let devices = StaticDevices::new(&["USB Mic"], &["Monitors", "Headphones"]);
        let outputs = devices.list(Direction::Output);
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].id, DEFAULT_DEVICE);
        assert!(outputs[0].is_default);
        assert_eq!(outputs[2].name, "Headphones");
    }

    #[test]
    fn lookup_is_per_direction() {
        let devices = StaticDevices::new(&["USB Mic"], &["Monitors"]);
        assert!(devices.contains(Direction::Input, Some("USB Mic")));
        assert!(!devices.contains(Direction::Output, Some("USB Mic")));
        assert!(devices.contains(Direction::Output, None));
        assert!(devices.contains(Direction::Output, Some("default")));
        assert!(!devices.contains(Direction::Output, Some("Nope")));
    }
}
