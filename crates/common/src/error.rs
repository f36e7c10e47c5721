//! Common error types for SkinScan
//!
//! `ServiceError` covers everything that can abort startup or a whole component.
//! Per-request failures never use it; they travel as `ErrorCode`s on the event channel.

use skinscan_proto::ErrorCode;
use thiserror::Error;

/// Main error type for SkinScan
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine creation or loading errors
    #[error("Engine error: {0}")]
    Engine(String),

    /// Startup latency estimation failed
    #[error("Estimation error: {0}")]
    Estimate(String),

    /// Tensor data errors (weights files, shapes)
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Client-facing code for this error when it has to be reported per request
    pub fn to_code(&self) -> ErrorCode {
        match self {
            ServiceError::InvalidInput(_) => ErrorCode::DataEmpty,
            _ => ErrorCode::SystemFailure,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ServiceError::Config(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        ServiceError::Engine(msg.into())
    }

    /// Create an estimation error
    pub fn estimate(msg: impl Into<String>) -> Self {
        ServiceError::Estimate(msg.into())
    }

    /// Create a tensor error
    pub fn tensor(msg: impl Into<String>) -> Self {
        ServiceError::Tensor(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ServiceError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ServiceError::Internal(msg.into())
    }
}

/// Result type alias for SkinScan operations
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_and_codes() {
        let err = ServiceError::config("maxBatches must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Configuration error: maxBatches must be greater than 0"
        );
        assert_eq!(err.to_code(), ErrorCode::SystemFailure);
        assert_eq!(ServiceError::invalid_input("empty").to_code(), ErrorCode::DataEmpty);
    }

    #[test]
    fn test_io_conversion() {
        fn open() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here.json")?)
        }

        assert!(matches!(open(), Err(ServiceError::Io(_))));
    }
}
