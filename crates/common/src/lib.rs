//! SkinScan common library
//!
//! This crate contains settings, errors and metrics shared across SkinScan components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::Settings;
pub use error::{Result, ServiceError};
pub use metrics::{MetricsRegistry, METRICS};
