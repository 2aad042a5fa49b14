//! Error types for gpuplug

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for gpuplug
#[derive(Error, Debug)]
pub enum GpuplugError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A mandatory control device is not present on the host
    #[error("Required device {} is missing", .0.display())]
    MissingDevice(PathBuf),

    /// Device directory could not be scanned
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Allocation asked for a device that was never discovered
    #[error("invalid allocation request with non-existing device {0}")]
    UnknownDevice(String),

    /// Allocation asked for a device that is not healthy
    #[error("invalid allocation request with unhealthy device {0}")]
    UnhealthyDevice(String),

    /// Plugin socket could not be bound
    #[error("Bind error: {0}")]
    Bind(String),

    /// Registration with the kubelet failed
    #[error("Registration error: {0}")]
    Registration(String),

    /// Plugin server failed while serving
    #[error("Serve error: {0}")]
    Serve(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gpuplug operations
pub type GpuplugResult<T> = Result<T, GpuplugError>;

impl From<toml::de::Error> for GpuplugError {
    fn from(err: toml::de::Error) -> Self {
        GpuplugError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuplugError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_missing_device_names_path() {
        let err = GpuplugError::MissingDevice(PathBuf::from("/dev/nvidiactl"));
        assert_eq!(err.to_string(), "Required device /dev/nvidiactl is missing");
    }

    #[test]
    fn test_allocation_errors_name_device() {
        let err = GpuplugError::UnknownDevice("nvidia7".to_string());
        assert!(err.to_string().contains("non-existing device nvidia7"));

        let err = GpuplugError::UnhealthyDevice("nvidia0".to_string());
        assert!(err.to_string().contains("unhealthy device nvidia0"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GpuplugError = io_err.into();
        assert!(matches!(err, GpuplugError::Io(_)));
    }
}
