//! Agent: one handler paired with one worker task.
//!
//! State transitions:
//! ```text
//! CREATED → RUNNING → STOPPED
//!     ↓                  ↑
//!     └──────────────────┘  (stopped before it ever started)
//! ```

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{AgentInfo, AgentOutcome};
use super::handler::{Endpoint, Handler};
use super::shared::ServerCore;
use crate::types::{AgentId, Error, Result};

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Created,
    Running,
    Stopped,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        self == AgentState::Stopped
    }

    /// Check if transition is valid. There is no way back from STOPPED.
    pub fn can_transition_to(self, to: AgentState) -> bool {
        matches!(
            (self, to),
            (AgentState::Created, AgentState::Running)
                | (AgentState::Created, AgentState::Stopped)
                | (AgentState::Running, AgentState::Stopped)
        )
    }
}

/// A live connection: one handler and the worker task driving it.
pub struct Agent<H: Handler> {
    id: AgentId,
    peer: SocketAddr,
    started_at: DateTime<Utc>,
    state: Mutex<AgentState>,
    handler: Mutex<Option<H>>,
    cancel: CancellationToken,
    // Held across the join in `stop()` so concurrent stoppers wait for the first.
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<H: Handler> fmt::Debug for Agent<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<H: Handler> Agent<H> {
    pub fn new(handler: H, peer: SocketAddr) -> Self {
        Self {
            id: AgentId::new(),
            peer,
            started_at: Utc::now(),
            state: Mutex::new(AgentState::Created),
            handler: Mutex::new(Some(handler)),
            cancel: CancellationToken::new(),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> AgentState {
        *self.lock_state()
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.id.clone(),
            peer: self.peer,
            state: self.state(),
            started_at: self.started_at,
        }
    }

    /// Bind the handler to `stream` and spawn its worker on the core's tracker.
    ///
    /// Returns as soon as the worker is spawned. When the handler finishes the
    /// worker removes the agent from the registry and publishes `AgentDone`.
    pub(crate) async fn start(
        self: &Arc<Self>,
        stream: TcpStream,
        core: Arc<ServerCore<H>>,
    ) -> Result<()> {
        let mut worker = self.worker.lock().await;
        let handler = {
            let mut state = self.lock_state();
            if !state.can_transition_to(AgentState::Running) {
                return Err(Error::state_transition(format!(
                    "agent {} cannot start from {:?}",
                    self.id, *state
                )));
            }
            let Some(handler) = self.lock_handler().take() else {
                return Err(Error::state_transition(format!(
                    "agent {} has no handler",
                    self.id
                )));
            };
            *state = AgentState::Running;
            handler
        };

        let endpoint = Endpoint {
            stream,
            peer: self.peer,
            agent_id: self.id.clone(),
        };
        let agent = Arc::clone(self);
        let stop = self.cancel.clone();
        let tracker = core.tracker().clone();

        *worker = Some(tracker.spawn(async move {
            let outcome = AssertUnwindSafe(drive(handler, endpoint, stop))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| AgentOutcome::Panicked {
                    message: panic_message(panic.as_ref()),
                });
            agent.transition(AgentState::Stopped);
            core.on_agent_done(&agent.id, agent.peer, outcome).await;
        }));
        Ok(())
    }

    /// Signal the handler to stop and wait for the worker to terminate.
    ///
    /// Idempotent, and safe against the worker finishing on its own at the
    /// same time. A worker still running after `timeout` is aborted and
    /// reported as [`Error::AgentJoin`].
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();

        let mut worker = self.worker.lock().await;
        if self.transition_from(AgentState::Created, AgentState::Stopped) {
            self.lock_handler().take();
            tracing::debug!(agent_id = %self.id, "agent stopped before start");
            return Ok(());
        }
        let Some(handle) = worker.as_mut() else {
            return Ok(());
        };

        let result = match tokio::time::timeout(timeout, &mut *handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_err)) => Err(Error::agent_join(&self.id, join_err.to_string())),
            Err(_elapsed) => {
                handle.abort();
                Err(Error::agent_join(
                    &self.id,
                    format!("worker did not stop within {timeout:?}, aborted"),
                ))
            }
        };
        *worker = None;
        self.transition(AgentState::Stopped);
        result
    }

    fn transition(&self, to: AgentState) -> bool {
        let mut state = self.lock_state();
        if state.can_transition_to(to) {
            *state = to;
            true
        } else {
            false
        }
    }

    fn transition_from(&self, from: AgentState, to: AgentState) -> bool {
        let mut state = self.lock_state();
        if *state == from && from.can_transition_to(to) {
            *state = to;
            true
        } else {
            false
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handler(&self) -> MutexGuard<'_, Option<H>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run one connection through `setup → run → close`.
async fn drive<H: Handler>(
    mut handler: H,
    endpoint: Endpoint,
    stop: CancellationToken,
) -> AgentOutcome {
    let outcome = match handler.setup(endpoint).await {
        Err(e) => AgentOutcome::Failed {
            error: format!("setup failed: {e}"),
        },
        Ok(()) => match handler.run(stop.clone()).await {
            Ok(()) if stop.is_cancelled() => AgentOutcome::Stopped,
            Ok(()) => AgentOutcome::Completed,
            Err(e) => AgentOutcome::Failed {
                error: e.to_string(),
            },
        },
    };
    handler.close().await;
    outcome
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::{Command, HandlerResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum ReadOp {
        Read,
    }

    impl Command for ReadOp {
        const ALL: &'static [Self] = &[ReadOp::Read];

        fn name(&self) -> &'static str {
            "read"
        }
    }

    /// Reads until EOF or stop; counts `close()` calls.
    #[derive(Debug)]
    struct ReadUntilEof {
        stream: Option<TcpStream>,
        closes: Arc<AtomicUsize>,
        panic_on_run: bool,
    }

    impl ReadUntilEof {
        fn new(closes: Arc<AtomicUsize>) -> Self {
            Self {
                stream: None,
                closes,
                panic_on_run: false,
            }
        }
    }

    #[async_trait]
    impl Handler for ReadUntilEof {
        type Command = ReadOp;

        async fn setup(&mut self, endpoint: Endpoint) -> HandlerResult<()> {
            self.stream = Some(endpoint.stream);
            Ok(())
        }

        async fn run(&mut self, stop: CancellationToken) -> HandlerResult<()> {
            if self.panic_on_run {
                panic!("handler exploded");
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err("not set up".into());
            };
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return Ok(()),
                    read = stream.read(&mut buf) => {
                        if read? == 0 {
                            return Ok(());
                        }
                    }
                }
            }
        }

        async fn close(&mut self) {
            self.stream.take();
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (server, client, peer)
    }

    async fn registered(
        core: &Arc<ServerCore<ReadUntilEof>>,
        handler: ReadUntilEof,
        peer: SocketAddr,
    ) -> Arc<Agent<ReadUntilEof>> {
        let agent = Arc::new(Agent::new(handler, peer));
        core.registry().insert(Arc::clone(&agent)).await.unwrap();
        agent
    }

    #[test]
    fn test_state_transitions_are_one_directional() {
        assert!(AgentState::Created.can_transition_to(AgentState::Running));
        assert!(AgentState::Running.can_transition_to(AgentState::Stopped));
        assert!(AgentState::Created.can_transition_to(AgentState::Stopped));
        assert!(!AgentState::Stopped.can_transition_to(AgentState::Running));
        assert!(!AgentState::Running.can_transition_to(AgentState::Created));
        assert!(!AgentState::Stopped.can_transition_to(AgentState::Created));
        assert!(AgentState::Stopped.is_terminal());
    }

    #[tokio::test]
    async fn test_stop_signals_and_joins_worker() {
        let core = Arc::new(ServerCore::new(16));
        let closes = Arc::new(AtomicUsize::new(0));
        let (server, _client, peer) = socket_pair().await;

        let agent = registered(&core, ReadUntilEof::new(closes.clone()), peer).await;
        agent.start(server, core.clone()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);

        agent.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(core.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_worker_runs_on_core_tracker() {
        let core = Arc::new(ServerCore::new(16));
        let (server, client, peer) = socket_pair().await;

        let agent = registered(&core, ReadUntilEof::new(Arc::default()), peer).await;
        agent.start(server, core.clone()).await.unwrap();
        assert_eq!(core.tracker().len(), 1);

        drop(client);
        core.tracker().close();
        tokio::time::timeout(Duration::from_secs(5), core.tracker().wait())
            .await
            .unwrap();
        assert!(core.tracker().is_empty());
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_natural_completion_removes_from_registry() {
        let core = Arc::new(ServerCore::new(16));
        let mut events = core.subscribe();
        let closes = Arc::new(AtomicUsize::new(0));
        let (server, client, peer) = socket_pair().await;

        let agent = registered(&core, ReadUntilEof::new(closes.clone()), peer).await;
        agent.start(server, core.clone()).await.unwrap();
        drop(client);

        match events.recv().await.unwrap() {
            crate::server::ServerEvent::AgentDone { outcome, .. } => {
                assert_eq!(outcome, AgentOutcome::Completed)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(core.registry().is_empty().await);
        assert_eq!(agent.state(), AgentState::Stopped);

        // stop() after natural completion is a prompt no-op.
        agent.stop(Duration::from_millis(50)).await.unwrap();
        agent.stop(Duration::from_millis(50)).await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_stops_both_return() {
        let core = Arc::new(ServerCore::new(16));
        let (server, _client, peer) = socket_pair().await;

        let agent = registered(&core, ReadUntilEof::new(Arc::default()), peer).await;
        agent.start(server, core.clone()).await.unwrap();

        let (a, b) = tokio::join!(
            agent.stop(Duration::from_secs(5)),
            agent.stop(Duration::from_secs(5))
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_drops_handler() {
        let closes = Arc::new(AtomicUsize::new(0));
        let agent = Agent::new(
            ReadUntilEof::new(closes.clone()),
            "127.0.0.1:1".parse().unwrap(),
        );
        agent.stop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let core = Arc::new(ServerCore::new(16));
        let (server, _client, peer) = socket_pair().await;
        let (second, _client2, _) = socket_pair().await;

        let agent = registered(&core, ReadUntilEof::new(Arc::default()), peer).await;
        agent.start(server, core.clone()).await.unwrap();
        let err = agent.start(second, core.clone()).await.unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));

        agent.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let core = Arc::new(ServerCore::new(16));
        let mut events = core.subscribe();
        let (server, _client, peer) = socket_pair().await;

        let mut handler = ReadUntilEof::new(Arc::default());
        handler.panic_on_run = true;
        let agent = registered(&core, handler, peer).await;
        agent.start(server, core.clone()).await.unwrap();

        match events.recv().await.unwrap() {
            crate::server::ServerEvent::AgentDone { outcome, .. } => {
                assert_eq!(
                    outcome,
                    AgentOutcome::Panicked {
                        message: "handler exploded".to_string()
                    }
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(core.registry().is_empty().await);
        agent.stop(Duration::from_millis(50)).await.unwrap();
    }
}
