//! NVIDIA GPU discovery
//!
//! Scans the device directory for GPU nodes and checks the control
//! devices every container needs alongside its GPUs.

use gpuplug_core::{DefaultDevices, Device, DeviceSet, DevicesConfig, GpuplugError, GpuplugResult};
use regex::Regex;
use std::path::Path;
use tracing::{debug, info};

/// Discovers GPU devices on the local node
pub struct DeviceDiscovery {
    config: DevicesConfig,
    gpu_pattern: Regex,
}

impl DeviceDiscovery {
    /// Create a new discovery over the given device configuration.
    ///
    /// Fails if `gpu_device_pattern` is not a valid regular expression.
    pub fn new(config: DevicesConfig) -> GpuplugResult<Self> {
        let gpu_pattern = Regex::new(&config.gpu_device_pattern).map_err(|e| {
            GpuplugError::Config(format!(
                "invalid GPU device pattern {:?}: {}",
                config.gpu_device_pattern, e
            ))
        })?;
        Ok(Self {
            config,
            gpu_pattern,
        })
    }

    /// Whether a device-node file name denotes a GPU
    pub fn is_gpu_device_name(&self, name: &str) -> bool {
        self.gpu_pattern.is_match(name)
    }

    /// Check control devices and enumerate GPUs.
    ///
    /// Fails with [`GpuplugError::MissingDevice`] while the driver has not
    /// created its control nodes yet. Nothing on disk is modified.
    pub fn start(&self) -> GpuplugResult<(DeviceSet, DefaultDevices)> {
        let mut default_devices = DefaultDevices::new();

        for device in &self.config.control_devices {
            if !device_exists(device) {
                return Err(GpuplugError::MissingDevice(device.clone()));
            }
            default_devices.push(device.clone());
        }

        for device in &self.config.optional_devices {
            if device_exists(device) {
                default_devices.push(device.clone());
            } else {
                debug!(device = %device.display(), "Optional device not present");
            }
        }

        let devices = self.discover_gpus()?;
        Ok((devices, default_devices))
    }

    /// Walk the device directory for nodes matching the GPU pattern
    fn discover_gpus(&self) -> GpuplugResult<DeviceSet> {
        let dir = &self.config.dev_directory;
        let entries = std::fs::read_dir(dir).map_err(|e| {
            GpuplugError::Discovery(format!("failed to read {}: {}", dir.display(), e))
        })?;

        let mut devices = DeviceSet::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.is_gpu_device_name(&name) {
                info!(device = %name, "Found NVIDIA GPU");
                devices.insert(name.clone(), Device::healthy(name));
            }
        }

        Ok(devices)
    }
}

fn device_exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}
