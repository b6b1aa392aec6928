//! Per-connection handler contract.
//!
//! The harness never looks inside a connection. Everything about framing,
//! commands and business logic lives behind [`Handler`]; the server only
//! drives the sequence `setup → run → close` on a dedicated worker task.

use async_trait::async_trait;
use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::types::AgentId;

/// Opaque error type returned by handlers. The harness only logs it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Handler result type.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Closed set of protocol command identifiers a server is parametrized over.
///
/// Carries no dispatch logic; it only ties a handler family to a server
/// instance at the type level.
pub trait Command: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every command in the family.
    const ALL: &'static [Self];

    /// Stable name used in logs.
    fn name(&self) -> &'static str;
}

/// Transport endpoint handed to [`Handler::setup`].
#[derive(Debug)]
pub struct Endpoint {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub agent_id: AgentId,
}

/// Protocol logic bound to exactly one connection.
///
/// `close` is expressed as the `stop` token passed to `run`: cancelling it
/// from any task asks `run` to observe termination and return. After `run`
/// returns (or `setup` fails) the worker always calls [`Handler::close`] to
/// release transport resources, so implementations must make it idempotent.
#[async_trait]
pub trait Handler: Send + 'static {
    /// Command family this handler speaks.
    type Command: Command;

    /// Bind to the accepted transport.
    async fn setup(&mut self, endpoint: Endpoint) -> HandlerResult<()>;

    /// Execute the protocol loop until the peer disconnects, an unrecoverable
    /// error occurs, or `stop` is cancelled.
    async fn run(&mut self, stop: CancellationToken) -> HandlerResult<()>;

    /// Release transport resources.
    async fn close(&mut self);
}

/// Creates one fresh handler per accepted connection.
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Handler;

    fn create_handler(&self) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Handler,
{
    type Handler = H;

    fn create_handler(&self) -> H {
        self()
    }
}
