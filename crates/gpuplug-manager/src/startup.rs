//! Wait for the NVIDIA driver before serving

use gpuplug_core::PluginConfig;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::clock::{sleep_or_shutdown, Clock};
use crate::manager::GpuManager;

/// Retry [`GpuManager::start`] until it succeeds.
///
/// Discovery reads the device directory, so each attempt runs on the
/// blocking pool. Returns `None` if shutdown is requested before the driver
/// shows up.
pub async fn start_when_ready<C: Clock + ?Sized>(
    config: &PluginConfig,
    clock: &C,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<GpuManager> {
    loop {
        let attempt = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || GpuManager::start(&config)).await
        };
        match attempt {
            Ok(Ok(manager)) => return Some(manager),
            Ok(Err(e)) => debug!(error = %e, "GPU manager not ready, retrying"),
            Err(e) => error!(error = %e, "GPU discovery task failed, retrying"),
        }
        if sleep_or_shutdown(clock, config.timing.startup_retry(), shutdown).await {
            info!("Shutdown requested before GPUs became available");
            return None;
        }
    }
}
