//! State shared between the accept loop, every agent worker and `close()`.

use std::fmt;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use super::events::{AgentOutcome, ServerEvent};
use super::handler::Handler;
use super::registry::Registry;
use crate::types::AgentId;

pub(crate) struct ServerCore<H: Handler> {
    registry: Registry<H>,
    events: broadcast::Sender<ServerEvent>,
    workers: TaskTracker,
}

impl<H: Handler> fmt::Debug for ServerCore<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCore")
            .field("registry", &self.registry)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl<H: Handler> ServerCore<H> {
    pub(crate) fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            registry: Registry::new(),
            events,
            workers: TaskTracker::new(),
        }
    }

    pub(crate) fn registry(&self) -> &Registry<H> {
        &self.registry
    }

    /// Tracker every agent worker is spawned on.
    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.workers
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no subscriber is not an error.
    pub(crate) fn publish(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Called by a worker once its handler has finished, however it finished.
    pub(crate) async fn on_agent_done(
        &self,
        agent_id: &AgentId,
        peer: SocketAddr,
        outcome: AgentOutcome,
    ) {
        let removed = self.registry.remove(agent_id).await.is_some();
        match &outcome {
            AgentOutcome::Completed | AgentOutcome::Stopped => {
                tracing::debug!(%agent_id, %peer, ?outcome, removed, "agent done");
            }
            AgentOutcome::Failed { error } => {
                tracing::warn!(%agent_id, %peer, %error, removed, "agent failed");
            }
            AgentOutcome::Panicked { message } => {
                tracing::error!(%agent_id, %peer, %message, removed, "agent handler panicked");
            }
        }
        self.publish(ServerEvent::AgentDone {
            agent_id: agent_id.clone(),
            peer,
            outcome,
        });
    }
}
