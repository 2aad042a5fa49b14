//! Configuration types for gpuplug

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main plugin configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Container mount configuration
    pub manager: ManagerConfig,
    /// Kubelet plugin endpoint configuration
    pub plugin: EndpointConfig,
    /// Device discovery configuration
    pub devices: DevicesConfig,
    /// Poll and retry intervals
    pub timing: TimingConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl PluginConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::GpuplugError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::GpuplugError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::GpuplugError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Host directory bind-mounted read-only into every container that gets a GPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Path on the host that contains the NVIDIA libraries
    pub host_path: PathBuf,
    /// Path inside the container where `host_path` is mounted
    pub container_path: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host_path: PathBuf::from("/home/kubernetes/bin/nvidia"),
            container_path: PathBuf::from("/usr/local/nvidia"),
        }
    }
}

/// Kubelet device-plugin endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Directory where the kubelet expects plugin sockets
    pub mount_path: PathBuf,
    /// File name of the kubelet registration socket inside `mount_path`
    pub kubelet_endpoint: String,
    /// Prefix of the plugin socket file name
    pub endpoint_prefix: String,
    /// Extended resource name advertised to the kubelet
    pub resource_name: String,
}

impl EndpointConfig {
    /// Full path of the kubelet registration socket
    pub fn kubelet_socket(&self) -> PathBuf {
        self.mount_path.join(&self.kubelet_endpoint)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            mount_path: PathBuf::from("/var/lib/kubelet/device-plugins"),
            kubelet_endpoint: "kubelet.sock".to_string(),
            endpoint_prefix: "nvidiaGPU".to_string(),
            resource_name: "nvidia.com/gpu".to_string(),
        }
    }
}

/// GPU nodes are `nvidia` followed only by digits; `nvidiactl` and
/// `nvidia-uvm` are control nodes.
pub const DEFAULT_GPU_DEVICE_PATTERN: &str = "^nvidia[0-9]*$";

/// Device discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Directory scanned for GPU device nodes
    pub dev_directory: PathBuf,
    /// Regular expression matched against device-node file names to find GPUs
    pub gpu_device_pattern: String,
    /// Control devices that must exist before the plugin starts
    pub control_devices: Vec<PathBuf>,
    /// Devices attached to allocations only when present on the host
    pub optional_devices: Vec<PathBuf>,
    /// Health probe used by ListAndWatch
    pub health_probe: HealthProbeKind,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            dev_directory: PathBuf::from("/dev"),
            gpu_device_pattern: DEFAULT_GPU_DEVICE_PATTERN.to_string(),
            control_devices: vec![
                PathBuf::from("/dev/nvidiactl"),
                PathBuf::from("/dev/nvidia-uvm"),
            ],
            optional_devices: vec![PathBuf::from("/dev/nvidia-uvm-tools")],
            health_probe: HealthProbeKind::Always,
        }
    }
}

/// Health probe strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthProbeKind {
    /// Every discovered device is reported healthy
    Always,
    /// A device is healthy while its device node exists
    DeviceNode,
}

/// Poll and retry intervals, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between startup attempts while drivers are not ready
    pub startup_retry_secs: u64,
    /// Delay between plugin server readiness checks
    pub ready_poll_secs: u64,
    /// Delay between plugin socket existence checks
    pub socket_poll_secs: u64,
    /// Delay between health re-evaluations in ListAndWatch
    pub health_interval_secs: u64,
    /// Timeout for dialing the kubelet
    pub dial_timeout_secs: u64,
}

impl TimingConfig {
    pub fn startup_retry(&self) -> Duration {
        Duration::from_secs(self.startup_retry_secs)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_secs(self.ready_poll_secs)
    }

    pub fn socket_poll(&self) -> Duration {
        Duration::from_secs(self.socket_poll_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_retry_secs: 5,
            ready_poll_secs: 1,
            socket_poll_secs: 1,
            health_interval_secs: 5,
            dial_timeout_secs: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
