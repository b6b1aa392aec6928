//! TCP server: accept loop and coordinated shutdown.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::agent::Agent;
use super::events::{AgentInfo, ServerEvent, ShutdownReport};
use super::handler::{Command, Handler, HandlerFactory};
use super::shared::ServerCore;
use crate::types::{bind_target, AgentId, Error, Result, ServerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Listening,
    Closed,
}

#[derive(Debug)]
struct ListenState {
    lifecycle: Lifecycle,
    accept_task: Option<JoinHandle<()>>,
}

/// Server owning the listening socket, the accept loop, and every live agent.
///
/// One handler per accepted connection is obtained from the injected
/// [`HandlerFactory`]. `close()` is terminal.
pub struct Server<F: HandlerFactory> {
    factory: Arc<F>,
    config: ServerConfig,
    core: Arc<ServerCore<F::Handler>>,
    shutdown: CancellationToken,
    accept_ended: CancellationToken,
    state: Mutex<ListenState>,
    local_addr: OnceLock<SocketAddr>,
}

impl<F: HandlerFactory> fmt::Debug for Server<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr.get())
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<F: HandlerFactory> Server<F> {
    pub fn new(factory: F, config: ServerConfig) -> Self {
        let core = Arc::new(ServerCore::new(config.event_capacity));
        Self {
            factory: Arc::new(factory),
            config,
            core,
            shutdown: CancellationToken::new(),
            accept_ended: CancellationToken::new(),
            state: Mutex::new(ListenState {
                lifecycle: Lifecycle::Idle,
                accept_task: None,
            }),
            local_addr: OnceLock::new(),
        }
    }

    /// Bind `bind_host:port` and start accepting in the background.
    ///
    /// Returns the bound address once the accept loop is spawned. Port 0 picks
    /// an ephemeral port. A bind failure is [`Error::Setup`] and closes the
    /// server for good.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr> {
        self.bind_and_accept(bind_target(&self.config.bind_host, port))
            .await
    }

    /// Same as [`Server::listen`] with a full socket address.
    pub async fn listen_on(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.bind_and_accept(addr.to_string()).await
    }

    async fn bind_and_accept(&self, target: String) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        match state.lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Listening => {
                return Err(Error::state_transition("server is already listening"));
            }
            Lifecycle::Closed => {
                return Err(Error::state_transition("server is closed"));
            }
        }

        // A failed bind is terminal: the server never accepts afterwards.
        let bound = match TcpListener::bind(target.as_str()).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!(addr = %target, error = %e, "failed to bind listening socket");
                state.lifecycle = Lifecycle::Closed;
                self.shutdown.cancel();
                return Err(Error::setup(&target, e));
            }
        };
        let _ = self.local_addr.set(addr);

        state.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.factory),
            Arc::clone(&self.core),
            self.shutdown.clone(),
            self.accept_ended.clone(),
        )));
        state.lifecycle = Lifecycle::Listening;

        tracing::info!(%addr, "server listening");
        self.core.publish(ServerEvent::Listening { addr });
        Ok(addr)
    }

    /// Stop accepting, stop every live agent and wait for all workers.
    ///
    /// Each agent gets `stop_timeout` to finish; workers that miss it are
    /// aborted and listed as stragglers. Calling `close()` again returns an
    /// empty report.
    pub async fn close(&self) -> ShutdownReport {
        let mut state = self.state.lock().await;
        if state.lifecycle == Lifecycle::Closed {
            return ShutdownReport::default();
        }
        state.lifecycle = Lifecycle::Closed;

        self.shutdown.cancel();
        if let Some(task) = state.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "accept loop task failed");
            }
        }

        let agents = self.core.registry().drain().await;
        let stop_timeout = self.config.stop_timeout;
        tracing::info!(live = agents.len(), "stopping agents");

        let results = futures::future::join_all(agents.iter().map(|agent| async move {
            (agent.id().clone(), agent.stop(stop_timeout).await)
        }))
        .await;

        let mut report = ShutdownReport {
            stopped: agents.len(),
            stragglers: Vec::new(),
        };
        for (agent_id, result) in results {
            if let Err(e) = result {
                tracing::warn!(%agent_id, error = %e, "agent did not stop cleanly");
                report.stragglers.push(agent_id);
            }
        }

        // Joins workers that finished on their own while shutdown was running.
        let workers = self.core.tracker();
        workers.close();
        if tokio::time::timeout(stop_timeout, workers.wait()).await.is_err() {
            tracing::warn!(remaining = workers.len(), "workers still running after shutdown");
        }

        tracing::info!(
            stopped = report.stopped,
            stragglers = report.stragglers.len(),
            "server closed"
        );
        self.core.publish(ServerEvent::Closed {
            report: report.clone(),
        });
        report
    }

    /// Stop a single connection. Returns `false` if no such agent is live.
    pub async fn stop_agent(&self, agent_id: &AgentId) -> Result<bool> {
        let Some(agent) = self.core.registry().remove(agent_id).await else {
            return Ok(false);
        };
        agent.stop(self.config.stop_timeout).await?;
        Ok(true)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.core.subscribe()
    }

    /// Address the listening socket is bound to, once `listen` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// True while the accept loop is running.
    pub fn is_accepting(&self) -> bool {
        self.local_addr.get().is_some() && !self.accept_ended.is_cancelled()
    }

    pub async fn agent_count(&self) -> usize {
        self.core.registry().len().await
    }

    pub async fn agents(&self) -> Vec<AgentInfo> {
        self.core
            .registry()
            .snapshot()
            .await
            .iter()
            .map(|agent| agent.info())
            .collect()
    }

    /// The closed command family this server's handlers speak.
    pub fn commands(&self) -> &'static [<F::Handler as Handler>::Command] {
        <<F::Handler as Handler>::Command as Command>::ALL
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl<F: HandlerFactory> Drop for Server<F> {
    fn drop(&mut self) {
        // Without close() the accept loop would outlive the server.
        self.shutdown.cancel();
    }
}

async fn accept_loop<F: HandlerFactory>(
    listener: TcpListener,
    factory: Arc<F>,
    core: Arc<ServerCore<F::Handler>>,
    shutdown: CancellationToken,
    ended: CancellationToken,
) {
    let error = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break None,
            accept = listener.accept() => match accept {
                Ok((stream, peer)) => {
                    if let Err(e) = dispatch(stream, peer, factory.as_ref(), &core).await {
                        if shutdown.is_cancelled() {
                            tracing::debug!(%peer, error = %e, "connection dropped during shutdown");
                            break None;
                        }
                        tracing::warn!(%peer, error = %e, "connection dropped");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed, accept loop terminating");
                    break Some(Error::Accept(e));
                }
            }
        }
    };

    drop(listener);
    ended.cancel();
    tracing::info!("accept loop stopped");
    core.publish(ServerEvent::AcceptLoopEnded {
        error: error.map(|e| e.to_string()),
    });
}

/// Register and start the agent for one accepted connection.
async fn dispatch<F: HandlerFactory>(
    stream: TcpStream,
    peer: SocketAddr,
    factory: &F,
    core: &Arc<ServerCore<F::Handler>>,
) -> Result<()> {
    let agent = Arc::new(Agent::new(factory.create_handler(), peer));
    core.registry().insert(Arc::clone(&agent)).await?;

    tracing::debug!(agent_id = %agent.id(), %peer, "connection accepted");
    core.publish(ServerEvent::AgentStarted {
        agent_id: agent.id().clone(),
        peer,
    });

    if let Err(e) = agent.start(stream, Arc::clone(core)).await {
        core.registry().remove(agent.id()).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EchoFactory;
    use tracing_test::traced_test;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_host: "127.0.0.1".to_string(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_lifecycle_is_logged() {
        let server = Server::new(EchoFactory::default(), local_config());
        server.listen(0).await.unwrap();
        server.close().await;

        assert!(logs_contain("server listening"));
        assert!(logs_contain("server closed"));
    }

    #[tokio::test]
    async fn test_close_before_listen_is_terminal() {
        let server = Server::new(EchoFactory::default(), local_config());
        assert_eq!(server.close().await, ShutdownReport::default());
        assert!(matches!(
            server.listen(0).await.unwrap_err(),
            Error::StateTransition(_)
        ));
        assert!(!server.is_accepting());
    }

    #[tokio::test]
    async fn test_refused_connection_keeps_accept_loop_running() {
        use tokio::io::AsyncReadExt;

        let server = Server::new(EchoFactory::default(), local_config());
        let addr = server.listen(0).await.unwrap();
        // A closed registry refuses every insert while shutdown is not requested.
        server.core.registry().drain().await;

        for _ in 0..3 {
            let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(std::time::Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
        assert!(server.is_accepting());

        server.close().await;
        assert!(!server.is_accepting());
    }

    #[tokio::test]
    async fn test_drop_without_close_stops_accepting() {
        let server = Server::new(EchoFactory::default(), local_config());
        let addr = server.listen(0).await.unwrap();
        let ended = server.accept_ended.clone();
        drop(server);

        tokio::time::timeout(std::time::Duration::from_secs(5), ended.cancelled())
            .await
            .unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
