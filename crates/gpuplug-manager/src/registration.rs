//! Kubelet registration client

use gpuplug_core::{GpuplugError, GpuplugResult};
use gpuplug_proto::v1beta1::RegisterRequest;
use gpuplug_proto::{RegistrationClient, VERSION};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::service::plugin_options;

/// Open an insecure gRPC channel over a Unix domain socket.
///
/// The URI is a placeholder; every connection goes to `socket`.
pub async fn connect_unix(socket: &Path, timeout: Duration) -> Result<Channel, tonic::transport::Error> {
    let socket: PathBuf = socket.to_path_buf();
    Endpoint::from_static("http://[::]:50051")
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { UnixStream::connect(socket).await }
        }))
        .await
}

/// Announce a plugin endpoint to the kubelet.
///
/// `endpoint` is the socket file name, resolved by the kubelet relative to
/// its device-plugin directory. The connection is closed on return.
pub async fn register(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
    dial_timeout: Duration,
) -> GpuplugResult<()> {
    debug!(kubelet = %kubelet_socket.display(), endpoint, "Dialing kubelet");
    let channel = connect_unix(kubelet_socket, dial_timeout)
        .await
        .map_err(|e| {
            GpuplugError::Registration(format!("cannot connect to kubelet service: {}", e))
        })?;

    let mut client = RegistrationClient::new(channel);
    let request = RegisterRequest {
        version: VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(plugin_options()),
    };

    client.register(request).await.map_err(|status| {
        GpuplugError::Registration(format!("cannot register to kubelet service: {}", status))
    })?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use gpuplug_proto::v1beta1::Empty;
    use gpuplug_proto::{Registration, RegistrationServer};
    use std::sync::{Arc, Mutex};
    use tokio::net::UnixListener;
    use tokio::sync::oneshot;
    use tokio_stream::wrappers::UnixListenerStream;
    use tonic::{Request, Response, Status};

    /// In-process stand-in for the kubelet registration service
    #[derive(Clone, Default)]
    pub(crate) struct FakeKubelet {
        pub requests: Arc<Mutex<Vec<RegisterRequest>>>,
        pub reject: bool,
    }

    impl FakeKubelet {
        pub fn registered(&self) -> Vec<RegisterRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> Result<Response<Empty>, Status> {
            if self.reject {
                return Err(Status::invalid_argument("resource already registered"));
            }
            self.requests.lock().unwrap().push(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }

    /// Serve `kubelet` on `socket` until the returned sender fires or drops
    pub(crate) fn start_fake_kubelet(socket: &Path, kubelet: FakeKubelet) -> oneshot::Sender<()> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let listener = UnixListener::bind(socket).unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(kubelet))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        shutdown_tx
    }

    #[tokio::test]
    async fn test_register_sends_endpoint_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("kubelet.sock");
        let kubelet = FakeKubelet::default();
        let _shutdown = start_fake_kubelet(&socket, kubelet.clone());

        register(&socket, "nvidiaGPU-1.sock", "nvidia.com/gpu", Duration::from_secs(5))
            .await
            .unwrap();

        let requests = kubelet.registered();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].version, "v1beta1");
        assert_eq!(requests[0].endpoint, "nvidiaGPU-1.sock");
        assert_eq!(requests[0].resource_name, "nvidia.com/gpu");
        assert!(requests[0].options.is_some());
    }

    #[tokio::test]
    async fn test_register_without_kubelet() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("kubelet.sock");

        let err = register(&socket, "p.sock", "nvidia.com/gpu", Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            GpuplugError::Registration(msg) => assert!(msg.contains("cannot connect")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("kubelet.sock");
        let kubelet = FakeKubelet {
            reject: true,
            ..Default::default()
        };
        let _shutdown = start_fake_kubelet(&socket, kubelet);

        let err = register(&socket, "p.sock", "nvidia.com/gpu", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            GpuplugError::Registration(msg) => assert!(msg.contains("cannot register")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
