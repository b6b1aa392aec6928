//! Core types for the server harness.
//!
//! - **IDs**: Strongly-typed identifiers (AgentId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the server, logging, and echo protocol

mod config;
mod errors;
mod ids;

pub(crate) use errors::bind_target;

pub use config::{Config, EchoConfig, ObservabilityConfig, ServerConfig};
pub use errors::{Error, Result};
pub use ids::AgentId;
