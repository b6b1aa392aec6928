//! Reference protocol built on the harness.
//!
//! The server core defines no framing; this module supplies a small
//! length-prefixed echo protocol used by the `netharness-echo` binary and the
//! integration tests.

pub mod codec;
pub mod echo;

pub use echo::{EchoCommand, EchoFactory, EchoHandler};
