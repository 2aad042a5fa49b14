//! Shared device table

use gpuplug_core::{Device, DeviceSet, GpuplugError, GpuplugResult};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::health::HealthProbe;

/// Device set shared between Allocate calls and ListAndWatch streams.
///
/// Health is the only mutable field and changes only through [`refresh`].
///
/// [`refresh`]: DeviceRegistry::refresh
pub struct DeviceRegistry {
    devices: RwLock<DeviceSet>,
}

impl DeviceRegistry {
    /// Create a registry from discovered devices
    pub fn new(devices: DeviceSet) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Copy of all devices, ordered by id
    pub async fn snapshot(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Verify every id is known and healthy.
    ///
    /// Fails on the first offending id; callers must not produce partial
    /// results.
    pub async fn ensure_allocatable(&self, ids: &[String]) -> GpuplugResult<()> {
        let devices = self.devices.read().await;
        for id in ids {
            match devices.get(id) {
                None => return Err(GpuplugError::UnknownDevice(id.clone())),
                Some(device) if !device.is_healthy() => {
                    return Err(GpuplugError::UnhealthyDevice(id.clone()))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Re-probe every device; returns whether any health changed.
    ///
    /// Probes may touch the filesystem, so they run on the blocking pool
    /// without holding the table lock.
    pub async fn refresh(&self, probe: Arc<dyn HealthProbe>) -> bool {
        let ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        let probed = tokio::task::spawn_blocking(move || {
            ids.into_iter()
                .map(|id| {
                    let health = probe.probe(&id);
                    (id, health)
                })
                .collect::<Vec<_>>()
        })
        .await;
        let probed = match probed {
            Ok(probed) => probed,
            Err(e) => {
                error!(error = %e, "Health probe task failed");
                return false;
            }
        };

        let mut devices = self.devices.write().await;
        let mut changed = false;
        for (id, health) in probed {
            let Some(device) = devices.get_mut(&id) else {
                continue;
            };
            if device.health != health {
                info!(device = %id, from = %device.health, to = %health, "Device health changed");
                device.health = health;
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::AlwaysHealthy;
    use gpuplug_core::Health;

    struct Fixed(Health);

    impl HealthProbe for Fixed {
        fn probe(&self, _device_id: &str) -> Health {
            self.0
        }
    }

    fn registry(ids: &[&str]) -> DeviceRegistry {
        DeviceRegistry::new(
            ids.iter()
                .map(|id| (id.to_string(), Device::healthy(*id)))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_snapshot_is_ordered() {
        let registry = registry(&["nvidia1", "nvidia0"]);
        let ids: Vec<String> = registry.snapshot().await.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["nvidia0", "nvidia1"]);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_ensure_allocatable() {
        let registry = registry(&["nvidia0"]);
        assert!(registry
            .ensure_allocatable(&["nvidia0".to_string()])
            .await
            .is_ok());

        let err = registry
            .ensure_allocatable(&["nvidia0".to_string(), "nvidia3".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, GpuplugError::UnknownDevice(id) if id == "nvidia3"));
    }

    #[tokio::test]
    async fn test_refresh_reports_transitions_once() {
        let registry = registry(&["nvidia0", "nvidia1"]);

        assert!(!registry.refresh(Arc::new(AlwaysHealthy)).await);
        assert!(registry.refresh(Arc::new(Fixed(Health::Unhealthy))).await);
        assert!(!registry.refresh(Arc::new(Fixed(Health::Unhealthy))).await);

        let err = registry
            .ensure_allocatable(&["nvidia1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, GpuplugError::UnhealthyDevice(id) if id == "nvidia1"));

        assert!(registry.refresh(Arc::new(AlwaysHealthy)).await);
        assert!(registry
            .snapshot()
            .await
            .iter()
            .all(|d| d.health == Health::Healthy));
    }
}
