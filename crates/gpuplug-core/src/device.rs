//! GPU device model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Binary health of a device as reported to the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// Wire representation used by the device plugin protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GPU device exposed to the kubelet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device id, equal to the device-node file name
    pub id: String,
    /// Current health
    pub health: Health,
}

impl Device {
    /// Create a healthy device
    pub fn healthy(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            health: Health::Healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

/// Discovered devices keyed by id
pub type DeviceSet = BTreeMap<String, Device>;

/// Control device nodes attached to every allocation
pub type DefaultDevices = Vec<PathBuf>;
