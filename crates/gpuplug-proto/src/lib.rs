//! gpuplug-proto: Kubelet device plugin protocol
//!
//! Generated from `proto/v1beta1/api.proto`. The kubelet serves
//! `Registration`; device plugins serve `DevicePlugin`.

// Proto types generated from v1beta1/api.proto
pub mod v1beta1 {
    #![allow(clippy::derive_partial_eq_without_eq)]
    #![allow(missing_docs)]

    tonic::include_proto!("v1beta1");
}

pub use v1beta1::device_plugin_client::DevicePluginClient;
pub use v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer};
pub use v1beta1::registration_client::RegistrationClient;
pub use v1beta1::registration_server::{Registration, RegistrationServer};

/// API version the plugin is built against
pub const VERSION: &str = "v1beta1";

/// Device is discoverable and may be allocated
pub const HEALTHY: &str = "Healthy";

/// Device must not be allocated
pub const UNHEALTHY: &str = "Unhealthy";
