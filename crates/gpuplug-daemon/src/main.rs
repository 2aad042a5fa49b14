//! gpuplug daemon
//!
//! Exposes the node's NVIDIA GPUs to the kubelet as `nvidia.com/gpu`.

use anyhow::Context;
use clap::Parser;
use gpuplug_core::PluginConfig;
use gpuplug_manager::{start_when_ready, GrpcBackend, PluginServer, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// gpuplug daemon - Kubernetes device plugin for NVIDIA GPUs
#[derive(Parser, Debug)]
#[command(name = "gpuplugd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host directory holding the NVIDIA driver libraries [default: /home/kubernetes/bin/nvidia]
    #[arg(long)]
    host_path: Option<PathBuf>,

    /// Where the driver directory is mounted in containers [default: /usr/local/nvidia]
    #[arg(long)]
    container_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<PluginConfig> {
        let mut config = match &self.config {
            Some(path) => PluginConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => PluginConfig::default(),
        };

        if let Some(host_path) = &self.host_path {
            config.manager.host_path = host_path.clone();
        }
        if let Some(container_path) = &self.container_path {
            config.manager.container_path = container_path.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        Ok(config)
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_lowercase()))
        .with_context(|| format!("invalid log level {level:?}"))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set subscriber")
}

/// Raise `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for SIGINT");
                    return;
                }
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        shutdown.send_replace(true);
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_tracing(&config.logging.level)?;

    info!("Starting gpuplug daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host_path = %config.manager.host_path.display(),
        container_path = %config.manager.container_path.display(),
        resource = %config.plugin.resource_name,
        "Plugin configuration"
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx)?;

    let Some(manager) = start_when_ready(&config, &SystemClock, &mut shutdown_rx).await else {
        return Ok(());
    };
    info!(
        mount_path = %config.plugin.mount_path.display(),
        "GPU manager ready, starting device-plugin"
    );

    let backend = GrpcBackend::new(Arc::new(manager), &config);
    PluginServer::from_config(backend, SystemClock, &config)
        .run(shutdown_rx)
        .await
        .context("device-plugin terminated")?;

    info!("gpuplug daemon stopped");
    Ok(())
}
