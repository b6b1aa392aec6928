//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use std::net::SocketAddr;
use thiserror::Error;

use super::AgentId;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the server harness.
#[derive(Error, Debug)]
pub enum Error {
    /// The listening socket could not be bound. The server never accepts.
    #[error("setup error: failed to bind {addr}: {source}")]
    Setup {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The accept loop hit an I/O failure and terminated.
    #[error("accept error: {0}")]
    Accept(#[source] std::io::Error),

    /// A worker could not be joined cleanly while stopping its agent.
    #[error("agent {agent_id} join error: {reason}")]
    AgentJoin { agent_id: AgentId, reason: String },

    /// Failure reported by a connection handler.
    #[error("handler error: {0}")]
    Handler(String),

    /// Invalid lifecycle transition (relisten, double start).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Configuration could not be loaded or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn setup(addr: impl ToString, source: std::io::Error) -> Self {
        Self::Setup {
            addr: addr.to_string(),
            source,
        }
    }

    pub fn agent_join(agent_id: &AgentId, reason: impl Into<String>) -> Self {
        Self::AgentJoin {
            agent_id: agent_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error is fatal to `listen()`.
    pub fn is_setup(&self) -> bool {
        matches!(self, Error::Setup { .. })
    }
}

/// Format a bind target for error messages without requiring a parsed address.
pub(crate) fn bind_target(host: &str, port: u16) -> String {
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}
