//! Server lifecycle events and reports.
//!
//! Failures inside the accept loop and inside individual agents never reach
//! the caller as errors. They are published here instead, on a broadcast
//! channel the embedding program may subscribe to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::agent::AgentState;
use crate::types::{AgentId, Error};

/// How an agent's worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentOutcome {
    /// `run()` returned on its own (peer disconnected, protocol ended).
    Completed,
    /// `run()` returned after observing the stop signal.
    Stopped,
    /// `setup()` or `run()` returned an error.
    Failed { error: String },
    /// The handler panicked.
    Panicked { message: String },
}

impl AgentOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, AgentOutcome::Failed { .. } | AgentOutcome::Panicked { .. })
    }

    /// The handler failure as a crate error, if the agent failed.
    pub fn to_error(&self) -> Option<Error> {
        match self {
            AgentOutcome::Failed { error } => Some(Error::handler(error.clone())),
            AgentOutcome::Panicked { message } => {
                Some(Error::handler(format!("panicked: {message}")))
            }
            AgentOutcome::Completed | AgentOutcome::Stopped => None,
        }
    }
}

/// Point-in-time view of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub peer: SocketAddr,
    pub state: AgentState,
    pub started_at: DateTime<Utc>,
}

/// Result of `Server::close()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Agents that were live when shutdown began and were stopped.
    pub stopped: usize,
    /// Agents whose workers did not join cleanly (timed out or panicked).
    pub stragglers: Vec<AgentId>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.stragglers.is_empty()
    }
}

/// Event published on the server's broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Listening {
        addr: SocketAddr,
    },
    AgentStarted {
        agent_id: AgentId,
        peer: SocketAddr,
    },
    AgentDone {
        agent_id: AgentId,
        peer: SocketAddr,
        outcome: AgentOutcome,
    },
    /// The accept loop exited. `error` is `None` when shutdown requested it.
    AcceptLoopEnded {
        error: Option<String>,
    },
    Closed {
        report: ShutdownReport,
    },
}
