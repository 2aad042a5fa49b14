//! gpuplug-manager: NVIDIA GPU management and the kubelet device-plugin service
//!
//! This crate provides everything behind the plugin socket:
//! - GPU discovery and the shared device registry
//! - Allocation of device nodes and driver mounts
//! - Health watching for ListAndWatch
//! - Kubelet registration and the serve/restart loop

pub mod backend;
pub mod clock;
pub mod discovery;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod registration;
pub mod registry;
pub mod server;
pub mod service;
pub mod startup;

pub use backend::GrpcBackend;
pub use clock::{Clock, SystemClock};
pub use discovery::DeviceDiscovery;
pub use health::{probe_for, AlwaysHealthy, DeviceNodeProbe, HealthProbe};
pub use lifecycle::{AfterStop, Fatal, Outcome, ServeState};
pub use manager::GpuManager;
pub use registration::register;
pub use registry::DeviceRegistry;
pub use server::{PluginServer, ServeBackend};
pub use service::{DevicePluginService, StopHandle};
pub use startup::start_when_ready;
