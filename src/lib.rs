//! # netharness - Protocol-Agnostic TCP Server Harness
//!
//! Accepts TCP connections and gives each one its own agent: a pluggable
//! [`server::Handler`] driven on a dedicated worker task. Provides:
//! - Non-blocking `listen(port)` with a background accept loop
//! - Injected per-connection handler factory
//! - A single-mutex registry of live agents
//! - Coordinated, bounded shutdown of the listener and every worker
//! - Lifecycle events for accept-loop and per-agent failures
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────┐
//!   TCP clients  →   │            Server                │
//!                    │  ┌───────────┐  ┌─────────────┐  │
//!                    │  │  Accept   │→ │  Registry   │  │
//!                    │  │   Loop    │  │ live Agents │  │
//!                    │  └───────────┘  └─────────────┘  │
//!                    │        ↓              ↑          │
//!                    │  ┌───────────┐  ┌─────────────┐  │
//!                    │  │  Agent    │→ │  Handler    │  │
//!                    │  │  worker   │  │ setup/run/  │  │
//!                    │  │           │  │   close     │  │
//!                    │  └───────────┘  └─────────────┘  │
//!                    └──────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod protocol;
pub mod server;
pub mod types;

// Internal utilities
pub mod observability;

pub use server::{Command, Handler, HandlerFactory, Server, ServerEvent, ShutdownReport};
pub use types::{Config, Error, Result, ServerConfig};
