//! gpuplug-core: Core types for the gpuplug device plugin
//!
//! This crate provides the fundamental types shared by the plugin:
//! - GPU device and health model
//! - Plugin socket naming
//! - Configuration types
//! - Error handling

pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;

pub use config::*;
pub use device::*;
pub use endpoint::*;
pub use error::*;
