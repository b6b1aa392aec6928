//! Registry of live agents.
//!
//! Every mutation (insert on accept, remove on completion, drain on shutdown)
//! goes through one mutex. Shutdown drains the map and stops the drained
//! agents outside the lock, so it never iterates a collection that agents are
//! concurrently removing themselves from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::agent::Agent;
use super::handler::Handler;
use crate::types::{AgentId, Error, Result};

struct Inner<H: Handler> {
    agents: HashMap<AgentId, Arc<Agent<H>>>,
    closed: bool,
}

pub struct Registry<H: Handler> {
    inner: Mutex<Inner<H>>,
}

impl<H: Handler> fmt::Debug for Registry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl<H: Handler> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Handler> Registry<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                agents: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a live agent. Refused once the registry has been drained.
    pub async fn insert(&self, agent: Arc<Agent<H>>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::state_transition(format!(
                "registry closed, agent {} not registered",
                agent.id()
            )));
        }
        inner.agents.insert(agent.id().clone(), agent);
        Ok(())
    }

    /// Remove an agent. Removing an id that is not present is a no-op.
    pub async fn remove(&self, id: &AgentId) -> Option<Arc<Agent<H>>> {
        self.inner.lock().await.agents.remove(id)
    }

    /// Take every registered agent and refuse further inserts.
    pub async fn drain(&self) -> Vec<Arc<Agent<H>>> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.agents.drain().map(|(_, agent)| agent).collect()
    }

    /// Copy of the current entries, taken under the lock.
    pub async fn snapshot(&self) -> Vec<Arc<Agent<H>>> {
        self.inner.lock().await.agents.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}
