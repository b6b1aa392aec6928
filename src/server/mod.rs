//! Connection harness: accept loop, per-connection agents, shutdown.
//!
//! ```text
//!   listen(port) ──► accept loop ──► HandlerFactory::create_handler()
//!                        │                     │
//!                        ▼                     ▼
//!                    Registry ◄──insert── Agent ──spawn──► worker: setup → run → close
//!                        ▲                                        │
//!                        └──────────── on_agent_done ◄────────────┘
//!   close() ──► cancel accept loop ──► drain Registry ──► stop + join each Agent
//! ```

mod agent;
mod events;
mod handler;
mod listener;
mod registry;
mod shared;

pub use agent::{Agent, AgentState};
pub use events::{AgentInfo, AgentOutcome, ServerEvent, ShutdownReport};
pub use handler::{Command, Endpoint, Handler, HandlerError, HandlerFactory, HandlerResult};
pub use listener::Server;
pub use registry::Registry;
