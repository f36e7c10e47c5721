//! SkinScan Gateway
//!
//! TCP front end that accepts image submissions from clients and routes each
//! classification outcome back to the connection that submitted it.

pub mod client;
pub mod error;
pub mod router;
pub mod server;

pub use client::GatewayClient;
pub use error::{GatewayError, Result};
pub use router::Router;
pub use server::Gateway;
