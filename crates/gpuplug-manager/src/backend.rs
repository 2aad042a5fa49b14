//! gRPC serve backend over Unix domain sockets

use async_trait::async_trait;
use gpuplug_core::{GpuplugError, GpuplugResult, PluginConfig, PluginEndpoint};
use gpuplug_proto::v1beta1::Empty;
use gpuplug_proto::{DevicePluginClient, DevicePluginServer};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use crate::manager::GpuManager;
use crate::registration::{connect_unix, register};
use crate::server::ServeBackend;
use crate::service::{wait_stopped, DevicePluginService, StopHandle};

struct RunningServer {
    stop: StopHandle,
    task: JoinHandle<()>,
}

/// Serves [`DevicePluginService`] with tonic and registers it with the kubelet
pub struct GrpcBackend {
    manager: Arc<GpuManager>,
    kubelet_socket: PathBuf,
    resource_name: String,
    dial_timeout: Duration,
    running: Option<RunningServer>,
}

impl GrpcBackend {
    pub fn new(manager: Arc<GpuManager>, config: &PluginConfig) -> Self {
        Self {
            manager,
            kubelet_socket: config.plugin.kubelet_socket(),
            resource_name: config.plugin.resource_name.clone(),
            dial_timeout: config.timing.dial_timeout(),
            running: None,
        }
    }
}

#[async_trait]
impl ServeBackend for GrpcBackend {
    async fn start(&mut self, endpoint: &PluginEndpoint) -> GpuplugResult<()> {
        let path = endpoint.path().to_path_buf();
        remove_socket(&path).await.map_err(|e| {
            GpuplugError::Bind(format!("cannot remove stale socket {}: {}", path.display(), e))
        })?;

        let listener = UnixListener::bind(&path)
            .map_err(|e| GpuplugError::Bind(format!("cannot listen on {}: {}", path.display(), e)))?;

        let stop = StopHandle::new();
        let service = DevicePluginService::new(self.manager.clone(), stop.clone());
        let mut stopped = stop.subscribe();

        let task = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    wait_stopped(&mut stopped).await;
                })
                .await;

            match result {
                Ok(()) => debug!(socket = %path.display(), "device-plugin server stopped"),
                Err(e) => error!(socket = %path.display(), error = %e, "device-plugin server failed"),
            }

            // Unlinking here makes a server stopped from inside visible to
            // the socket watch.
            if let Err(e) = remove_socket(&path).await {
                warn!(socket = %path.display(), error = %e, "Failed to remove plugin socket");
            }
        });

        self.running = Some(RunningServer { stop, task });
        Ok(())
    }

    async fn is_ready(&mut self, endpoint: &PluginEndpoint) -> bool {
        let channel = match connect_unix(endpoint.path(), self.dial_timeout).await {
            Ok(channel) => channel,
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Readiness dial failed");
                return false;
            }
        };
        DevicePluginClient::new(channel)
            .get_device_plugin_options(Empty {})
            .await
            .is_ok()
    }

    async fn register(&mut self, endpoint: &PluginEndpoint) -> GpuplugResult<()> {
        register(
            &self.kubelet_socket,
            endpoint.name(),
            &self.resource_name,
            self.dial_timeout,
        )
        .await
    }

    async fn socket_exists(&mut self, endpoint: &PluginEndpoint) -> bool {
        tokio::fs::symlink_metadata(endpoint.path()).await.is_ok()
    }

    async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop.stop();
        if let Err(e) = running.task.await {
            error!(error = %e, "device-plugin server task panicked");
        }
        info!("device-plugin server stopped");
    }
}

async fn remove_socket(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
