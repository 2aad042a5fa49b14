//! Plugin serve loop
//!
//! Drives [`ServeState`] through its transitions: mint an endpoint, bind
//! and serve it, register with the kubelet, then watch the socket file and
//! start over whenever it disappears.

use async_trait::async_trait;
use gpuplug_core::{GpuplugError, GpuplugResult, PluginConfig, PluginEndpoint};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::{sleep_or_shutdown, Clock};
use crate::lifecycle::{Outcome, ServeState};

/// Side effects of the serve loop
#[async_trait]
pub trait ServeBackend: Send {
    /// Bind the endpoint socket and start serving it in the background
    async fn start(&mut self, endpoint: &PluginEndpoint) -> GpuplugResult<()>;

    /// Whether the running server answers calls
    async fn is_ready(&mut self, endpoint: &PluginEndpoint) -> bool;

    /// Register the endpoint with the kubelet
    async fn register(&mut self, endpoint: &PluginEndpoint) -> GpuplugResult<()>;

    /// Whether the endpoint socket file is still on disk
    async fn socket_exists(&mut self, endpoint: &PluginEndpoint) -> bool;

    /// Stop the server and wait for its task to finish
    async fn stop(&mut self);
}

/// Owns the plugin socket lifecycle
pub struct PluginServer<B, C> {
    backend: B,
    clock: C,
    mount_path: PathBuf,
    endpoint_prefix: String,
    ready_poll: Duration,
    socket_poll: Duration,
    last_timestamp: Option<i64>,
}

impl<B: ServeBackend, C: Clock> PluginServer<B, C> {
    /// Create a serve loop with the default 1s poll intervals
    pub fn new(backend: B, clock: C, mount_path: impl Into<PathBuf>, endpoint_prefix: &str) -> Self {
        Self {
            backend,
            clock,
            mount_path: mount_path.into(),
            endpoint_prefix: endpoint_prefix.to_string(),
            ready_poll: Duration::from_secs(1),
            socket_poll: Duration::from_secs(1),
            last_timestamp: None,
        }
    }

    pub fn from_config(backend: B, clock: C, config: &PluginConfig) -> Self {
        Self::new(
            backend,
            clock,
            config.plugin.mount_path.clone(),
            &config.plugin.endpoint_prefix,
        )
        .with_poll_intervals(config.timing.ready_poll(), config.timing.socket_poll())
    }

    pub fn with_poll_intervals(mut self, ready_poll: Duration, socket_poll: Duration) -> Self {
        self.ready_poll = ready_poll;
        self.socket_poll = socket_poll;
        self
    }

    /// Serve until shutdown is requested or a fatal error occurs.
    ///
    /// Returns `Ok` after a cooperative shutdown and the fatal error
    /// otherwise; the server has always been stopped and joined first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> GpuplugResult<()> {
        let mut state = ServeState::Idle;

        while !state.is_terminal() {
            let outcome = match &state {
                ServeState::Idle => {
                    if *shutdown.borrow() {
                        Outcome::ShutdownRequested
                    } else {
                        Outcome::Minted(self.mint_endpoint())
                    }
                }
                ServeState::Listening { endpoint } => self.listen(endpoint).await,
                ServeState::Registering { endpoint } => {
                    self.register(endpoint, &mut shutdown).await
                }
                ServeState::Serving { endpoint } => {
                    self.watch_socket(endpoint, &mut shutdown).await
                }
                ServeState::Stopping { endpoint, .. } => {
                    debug!(endpoint = %endpoint, "Stopping device-plugin server");
                    self.backend.stop().await;
                    Outcome::Joined
                }
                ServeState::Exited | ServeState::Failed(_) => break,
            };
            state = state.next(outcome);
        }

        match state {
            ServeState::Failed(fatal) => {
                let err: GpuplugError = fatal.into();
                error!(error = %err, "device-plugin serve loop failed");
                Err(err)
            }
            _ => {
                info!("device-plugin serve loop exited");
                Ok(())
            }
        }
    }

    /// Mint a socket name strictly newer than the previous one
    fn mint_endpoint(&mut self) -> PluginEndpoint {
        let mut timestamp = self.clock.unix_timestamp();
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                timestamp = last + 1;
            }
        }
        self.last_timestamp = Some(timestamp);
        PluginEndpoint::mint(&self.mount_path, &self.endpoint_prefix, timestamp)
    }

    async fn listen(&mut self, endpoint: &PluginEndpoint) -> Outcome {
        info!(endpoint = %endpoint, "starting device-plugin server");
        match self.backend.start(endpoint).await {
            Ok(()) => Outcome::Bound,
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "starting device-plugin server failed");
                Outcome::BindFailed(e.to_string())
            }
        }
    }

    async fn register(
        &mut self,
        endpoint: &PluginEndpoint,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        // Registering before the server answers lets the kubelet dial back
        // into a socket that cannot serve yet.
        while !self.backend.is_ready(endpoint).await {
            debug!(endpoint = %endpoint, "device-plugin server not ready yet");
            if sleep_or_shutdown(&self.clock, self.ready_poll, shutdown).await {
                return Outcome::ShutdownRequested;
            }
        }
        info!(endpoint = %endpoint, "device-plugin server started serving");

        match self.backend.register(endpoint).await {
            Ok(()) => {
                info!(endpoint = %endpoint.name(), "device-plugin registered with the kubelet");
                Outcome::Registered
            }
            Err(e) => {
                error!(error = %e, "device-plugin registration failed");
                Outcome::RegistrationFailed(e.to_string())
            }
        }
    }

    async fn watch_socket(
        &mut self,
        endpoint: &PluginEndpoint,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        loop {
            if !self.backend.socket_exists(endpoint).await {
                warn!(endpoint = %endpoint, "device-plugin socket removed, restarting");
                return Outcome::SocketRemoved;
            }
            if sleep_or_shutdown(&self.clock, self.socket_poll, shutdown).await {
                info!("Shutdown requested");
                return Outcome::ShutdownRequested;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type CallLog = Arc<Mutex<Vec<String>>>;

    /// Backend that replays scripted answers and records every call
    #[derive(Default)]
    struct ScriptedBackend {
        calls: CallLog,
        bind_error: Option<String>,
        ready: VecDeque<bool>,
        registrations: VecDeque<Result<(), String>>,
        sockets: VecDeque<bool>,
    }

    #[async_trait]
    impl ServeBackend for ScriptedBackend {
        async fn start(&mut self, endpoint: &PluginEndpoint) -> GpuplugResult<()> {
            self.calls.lock().unwrap().push(format!("start {}", endpoint.name()));
            match &self.bind_error {
                Some(msg) => Err(GpuplugError::Bind(msg.clone())),
                None => Ok(()),
            }
        }

        async fn is_ready(&mut self, _endpoint: &PluginEndpoint) -> bool {
            self.calls.lock().unwrap().push("ready".to_string());
            self.ready.pop_front().unwrap_or(true)
        }

        async fn register(&mut self, endpoint: &PluginEndpoint) -> GpuplugResult<()> {
            self.calls.lock().unwrap().push(format!("register {}", endpoint.name()));
            match self.registrations.pop_front().unwrap_or(Ok(())) {
                Ok(()) => Ok(()),
                Err(msg) => Err(GpuplugError::Registration(msg)),
            }
        }

        async fn socket_exists(&mut self, _endpoint: &PluginEndpoint) -> bool {
            self.calls.lock().unwrap().push("stat".to_string());
            self.sockets.pop_front().unwrap_or(true)
        }

        async fn stop(&mut self) {
            self.calls.lock().unwrap().push("stop".to_string());
        }
    }

    /// Clock frozen at one timestamp whose sleeps return at once.
    /// Optionally raises shutdown after a number of sleeps.
    struct FakeClock {
        now: i64,
        sleeps: Arc<Mutex<Vec<Duration>>>,
        shutdown_after: Option<(usize, watch::Sender<bool>)>,
    }

    impl FakeClock {
        fn frozen(now: i64) -> Self {
            Self {
                now,
                sleeps: Arc::default(),
                shutdown_after: None,
            }
        }
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn unix_timestamp(&self) -> i64 {
            self.now
        }

        async fn sleep(&self, duration: Duration) {
            let count = {
                let mut sleeps = self.sleeps.lock().unwrap();
                sleeps.push(duration);
                sleeps.len()
            };
            if let Some((after, tx)) = &self.shutdown_after {
                if count >= *after {
                    let _ = tx.send(true);
                }
            }
            tokio::task::yield_now().await;
        }
    }

    fn calls(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn server(backend: ScriptedBackend, clock: FakeClock) -> PluginServer<ScriptedBackend, FakeClock> {
        PluginServer::new(backend, clock, "/plugins", "nvidiaGPU")
            .with_poll_intervals(Duration::from_secs(1), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_registration_failure_stops_then_fails() {
        let backend = ScriptedBackend {
            registrations: VecDeque::from([Err("connection refused".to_string())]),
            ..Default::default()
        };
        let log = backend.calls.clone();
        let (_tx, rx) = watch::channel(false);

        let result = server(backend, FakeClock::frozen(100)).run(rx).await;

        assert!(matches!(result, Err(GpuplugError::Registration(_))));
        assert_eq!(
            calls(&log),
            vec![
                "start nvidiaGPU-100.sock",
                "ready",
                "register nvidiaGPU-100.sock",
                "stop",
            ]
        );
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal_without_stop() {
        let backend = ScriptedBackend {
            bind_error: Some("permission denied".to_string()),
            ..Default::default()
        };
        let log = backend.calls.clone();
        let (_tx, rx) = watch::channel(false);

        let result = server(backend, FakeClock::frozen(100)).run(rx).await;

        assert!(matches!(result, Err(GpuplugError::Bind(_))));
        assert_eq!(calls(&log), vec!["start nvidiaGPU-100.sock"]);
    }

    #[tokio::test]
    async fn test_waits_for_ready_before_registering() {
        let backend = ScriptedBackend {
            ready: VecDeque::from([false, false, true]),
            registrations: VecDeque::from([Err("stop here".to_string())]),
            ..Default::default()
        };
        let log = backend.calls.clone();
        let clock = FakeClock::frozen(100);
        let sleeps = clock.sleeps.clone();
        let (_tx, rx) = watch::channel(false);

        let _ = server(backend, clock).run(rx).await;

        let log = calls(&log);
        let first_register = log.iter().position(|c| c.starts_with("register")).unwrap();
        assert_eq!(
            log[..first_register].iter().filter(|c| *c == "ready").count(),
            3
        );
        assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(1); 2]);
    }

    #[tokio::test]
    async fn test_socket_removal_restarts_with_new_endpoint() {
        let backend = ScriptedBackend {
            registrations: VecDeque::from([Ok(()), Err("stop here".to_string())]),
            sockets: VecDeque::from([true, true, false]),
            ..Default::default()
        };
        let log = backend.calls.clone();
        let clock = FakeClock::frozen(100);
        let sleeps = clock.sleeps.clone();
        let (_tx, rx) = watch::channel(false);

        let result = server(backend, clock).run(rx).await;
        assert!(matches!(result, Err(GpuplugError::Registration(_))));

        let log = calls(&log);
        let starts: Vec<&String> = log.iter().filter(|c| c.starts_with("start")).collect();
        assert_eq!(
            starts,
            vec!["start nvidiaGPU-100.sock", "start nvidiaGPU-101.sock"]
        );

        // Socket polled three times, stop before the second start.
        let stat_count = log.iter().filter(|c| *c == "stat").count();
        assert_eq!(stat_count, 3);
        let second_start = log.iter().position(|c| c == "start nvidiaGPU-101.sock").unwrap();
        assert_eq!(log[second_start - 1], "stop");
        assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(2); 2]);
    }

    #[tokio::test]
    async fn test_shutdown_while_serving() {
        let backend = ScriptedBackend::default();
        let log = backend.calls.clone();
        let (tx, rx) = watch::channel(false);
        let clock = FakeClock {
            now: 100,
            sleeps: Arc::default(),
            shutdown_after: Some((3, tx)),
        };

        let result = server(backend, clock).run(rx).await;

        assert!(result.is_ok());
        let log = calls(&log);
        assert_eq!(log.last().unwrap(), "stop");
        assert_eq!(log.iter().filter(|c| c.starts_with("start")).count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let backend = ScriptedBackend::default();
        let log = backend.calls.clone();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = server(backend, FakeClock::frozen(100)).run(rx).await;

        assert!(result.is_ok());
        assert!(calls(&log).is_empty());
    }

    #[test]
    fn test_mint_endpoint_is_monotonic() {
        let mut server = server(ScriptedBackend::default(), FakeClock::frozen(50));
        let a = server.mint_endpoint();
        let b = server.mint_endpoint();
        assert_eq!(a.name(), "nvidiaGPU-50.sock");
        assert_eq!(b.name(), "nvidiaGPU-51.sock");
        assert_eq!(a.path(), std::path::Path::new("/plugins/nvidiaGPU-50.sock"));
    }
}
