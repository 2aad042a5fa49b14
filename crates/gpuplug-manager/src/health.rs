//! Device health probing and the ListAndWatch loop

use gpuplug_core::{Device, GpuplugError, GpuplugResult, Health, HealthProbeKind};
use gpuplug_proto::v1beta1::{self, ListAndWatchResponse};
use gpuplug_proto::{HEALTHY, UNHEALTHY};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tonic::Status;
use tracing::{debug, error, info};

use crate::manager::GpuManager;
use crate::service::wait_stopped;

/// Health policy applied to each device on every ListAndWatch iteration
pub trait HealthProbe: Send + Sync {
    fn probe(&self, device_id: &str) -> Health;
}

/// Reports every device as healthy
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

impl HealthProbe for AlwaysHealthy {
    fn probe(&self, _device_id: &str) -> Health {
        Health::Healthy
    }
}

/// Healthy while the device node is still present in the device directory
#[derive(Debug, Clone)]
pub struct DeviceNodeProbe {
    dev_directory: PathBuf,
}

impl DeviceNodeProbe {
    pub fn new(dev_directory: impl Into<PathBuf>) -> Self {
        Self {
            dev_directory: dev_directory.into(),
        }
    }
}

impl HealthProbe for DeviceNodeProbe {
    fn probe(&self, device_id: &str) -> Health {
        if self.dev_directory.join(device_id).exists() {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }
}

/// Build the configured probe
pub fn probe_for(kind: HealthProbeKind, dev_directory: &Path) -> Arc<dyn HealthProbe> {
    match kind {
        HealthProbeKind::Always => Arc::new(AlwaysHealthy),
        HealthProbeKind::DeviceNode => Arc::new(DeviceNodeProbe::new(dev_directory)),
    }
}

pub(crate) type ListAndWatchSender = mpsc::Sender<Result<ListAndWatchResponse, Status>>;

/// Stream device lists to one ListAndWatch caller.
///
/// Sends the full list on the first iteration and afterwards whenever the
/// registry differs from what this stream last sent, so every open stream
/// sees every health transition. Returns `Ok` once `stop` is raised and an
/// error when the stream can no longer be written to.
pub async fn watch_devices(
    manager: Arc<GpuManager>,
    tx: ListAndWatchSender,
    mut stop: watch::Receiver<bool>,
) -> GpuplugResult<()> {
    info!("device-plugin: ListAndWatch start");
    let mut last_sent: Option<Vec<Device>> = None;

    loop {
        manager.refresh_health().await;
        let devices = manager.devices().await;

        if last_sent.as_ref() != Some(&devices) {
            let response = ListAndWatchResponse {
                devices: devices.iter().map(to_proto_device).collect(),
            };
            debug!(devices = response.devices.len(), "ListAndWatch: sending devices");

            if tx.send(Ok(response)).await.is_err() {
                error!("device-plugin: cannot update device states: stream closed");
                return Err(GpuplugError::Serve("ListAndWatch stream closed".to_string()));
            }
            last_sent = Some(devices);
        }

        tokio::select! {
            _ = wait_stopped(&mut stop) => {
                info!("device-plugin: ListAndWatch stopped");
                return Ok(());
            }
            _ = tx.closed() => {
                error!("device-plugin: ListAndWatch receiver went away");
                return Err(GpuplugError::Serve("ListAndWatch stream closed".to_string()));
            }
            _ = manager.clock().sleep(manager.health_interval()) => {}
        }
    }
}

fn to_proto_device(device: &Device) -> v1beta1::Device {
    v1beta1::Device {
        id: device.id.clone(),
        health: match device.health {
            Health::Healthy => HEALTHY,
            Health::Unhealthy => UNHEALTHY,
        }
        .to_string(),
        topology: None,
    }
}
