//! Gateway error types

use thiserror::Error;

/// Errors seen by gateway clients and connections
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Service error: {0}")]
    Service(#[from] skinscan_common::ServiceError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Unexpected message: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    Closed,
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
