//! NVIDIA GPU manager

use gpuplug_core::{
    DefaultDevices, Device, DeviceSet, GpuplugResult, ManagerConfig, PluginConfig,
};
use gpuplug_proto::v1beta1::{ContainerAllocateResponse, DeviceSpec, Mount};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::discovery::DeviceDiscovery;
use crate::health::{probe_for, AlwaysHealthy, HealthProbe};
use crate::registry::DeviceRegistry;

/// Cgroup permissions granted on every allocated device node
pub const DEVICE_PERMISSIONS: &str = "mrw";

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Owns the discovered GPUs and answers allocation requests
pub struct GpuManager {
    registry: DeviceRegistry,
    default_devices: DefaultDevices,
    dev_directory: PathBuf,
    mounts: ManagerConfig,
    probe: Arc<dyn HealthProbe>,
    health_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl GpuManager {
    /// Create a manager over already discovered devices
    pub fn new(
        devices: DeviceSet,
        default_devices: DefaultDevices,
        dev_directory: impl Into<PathBuf>,
        mounts: ManagerConfig,
    ) -> Self {
        Self {
            registry: DeviceRegistry::new(devices),
            default_devices,
            dev_directory: dev_directory.into(),
            mounts,
            probe: Arc::new(AlwaysHealthy),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Timer used between ListAndWatch health checks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Discover devices and build a manager from the plugin configuration.
    ///
    /// Fails while the driver's control devices are missing; callers retry.
    pub fn start(config: &PluginConfig) -> GpuplugResult<Self> {
        let (devices, default_devices) = DeviceDiscovery::new(config.devices.clone())?.start()?;
        info!(
            gpus = devices.len(),
            default_devices = default_devices.len(),
            "GPU manager started"
        );

        let probe = probe_for(config.devices.health_probe, &config.devices.dev_directory);
        Ok(Self::new(
            devices,
            default_devices,
            config.devices.dev_directory.clone(),
            config.manager.clone(),
        )
        .with_health_probe(probe)
        .with_health_interval(config.timing.health_interval()))
    }

    /// Current devices, ordered by id
    pub async fn devices(&self) -> Vec<Device> {
        self.registry.snapshot().await
    }

    pub fn default_devices(&self) -> &[PathBuf] {
        &self.default_devices
    }

    pub fn health_interval(&self) -> Duration {
        self.health_interval
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Re-evaluate health of every device; returns whether anything changed
    pub async fn refresh_health(&self) -> bool {
        self.registry.refresh(self.probe.clone()).await
    }

    /// Build the container artifacts for a set of device ids.
    ///
    /// Every id must be known and healthy, otherwise nothing is returned.
    /// Default devices and the driver library mount are always appended.
    pub async fn allocate(&self, device_ids: &[String]) -> GpuplugResult<ContainerAllocateResponse> {
        if let Err(e) = self.registry.ensure_allocatable(device_ids).await {
            warn!(devices = ?device_ids, error = %e, "Rejected allocation");
            return Err(e);
        }

        let mut response = ContainerAllocateResponse::default();
        for id in device_ids {
            response.devices.push(device_spec(&self.dev_directory.join(id)));
        }
        for path in &self.default_devices {
            response.devices.push(device_spec(path));
        }
        response.mounts.push(Mount {
            container_path: path_string(&self.mounts.container_path),
            host_path: path_string(&self.mounts.host_path),
            read_only: true,
        });

        info!(devices = ?device_ids, "Allocated GPUs");
        Ok(response)
    }
}

fn device_spec(path: &Path) -> DeviceSpec {
    let path = path_string(path);
    DeviceSpec {
        container_path: path.clone(),
        host_path: path,
        permissions: DEVICE_PERMISSIONS.to_string(),
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
