//! Plugin socket naming

use std::path::{Path, PathBuf};

/// A plugin socket under the kubelet's device-plugin directory.
///
/// A new endpoint is minted on every serve cycle so the kubelet never
/// reuses a stale registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEndpoint {
    name: String,
    path: PathBuf,
}

impl PluginEndpoint {
    /// Build `{prefix}-{unix_timestamp}.sock` under `mount_path`
    pub fn mint(mount_path: &Path, prefix: &str, unix_timestamp: i64) -> Self {
        let name = format!("{}-{}.sock", prefix, unix_timestamp);
        let path = mount_path.join(&name);
        Self { name, path }
    }

    /// Socket file name, as announced to the kubelet
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full socket path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Display for PluginEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
