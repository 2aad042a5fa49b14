//! DevicePlugin gRPC service

use gpuplug_core::GpuplugError;
use gpuplug_proto::v1beta1::{
    AllocateRequest, AllocateResponse, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse,
};
use gpuplug_proto::DevicePlugin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::health::watch_devices;
use crate::manager::GpuManager;

/// Stop signal shared by one plugin server and its streaming calls
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask the server and every ListAndWatch loop to finish
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once `stop` is raised or its sender is gone
pub async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Plugin options advertised to the kubelet
pub fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// Map a manager error onto a gRPC status for the caller
pub fn to_status(err: GpuplugError) -> Status {
    match err {
        GpuplugError::UnknownDevice(_) => Status::not_found(err.to_string()),
        GpuplugError::UnhealthyDevice(_) => Status::failed_precondition(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

/// gRPC front of a [`GpuManager`] for one serve cycle
pub struct DevicePluginService {
    manager: Arc<GpuManager>,
    stop: StopHandle,
}

impl DevicePluginService {
    pub fn new(manager: Arc<GpuManager>, stop: StopHandle) -> Self {
        Self { manager, stop }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let (tx, rx) = mpsc::channel(4);
        let manager = self.manager.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            if let Err(e) = watch_devices(manager, tx, stop.subscribe()).await {
                // A broken stream means the kubelet lost us; stopping the
                // server makes the serve loop start over.
                warn!(error = %e, "Stopping device-plugin server");
                stop.stop();
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        let mut response = AllocateResponse::default();

        for container in &request.container_requests {
            let allocation = self
                .manager
                .allocate(&container.devices_ids)
                .await
                .map_err(to_status)?;
            response.container_responses.push(allocation);
        }

        info!(
            containers = response.container_responses.len(),
            "device-plugin: Allocate served"
        );
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        debug!(devices = ?request.get_ref().devices_ids, "PreStartContainer");
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
