//! ota-agent: device-side OTA update daemon
//!
//! Exposes the [`ota_core::OtaManager`] command surface over a small local
//! HTTP API and takes care of logging and signal-driven shutdown.

pub mod api;
pub mod logging;
pub mod server;
pub mod shutdown;

pub use api::{create_router, ApiState};
pub use logging::LogOptions;
pub use server::AgentServer;
