//! Echo protocol: the bundled reference [`Handler`].
//!
//! Requests are frames whose code is an [`EchoCommand`]. Every request gets
//! exactly one reply frame.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;

use super::codec::{read_frame, timed_write};
use crate::server::{Command, Endpoint, Handler, HandlerFactory, HandlerResult};
use crate::types::{AgentId, EchoConfig};

/// Reply code: answer to `Ping`, empty payload.
pub const REPLY_PONG: u8 = 0x81;
/// Reply code: answer to `Echo`, payload echoed back.
pub const REPLY_ECHO: u8 = 0x82;
/// Reply code: answer to `Quit`, sent before the server closes the connection.
pub const REPLY_BYE: u8 = 0x83;
/// Reply code: unknown request code, payload is a UTF-8 message.
pub const REPLY_ERROR: u8 = 0xFF;

/// Request codes understood by [`EchoHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EchoCommand {
    Ping = 0x01,
    Echo = 0x02,
    Quit = 0x03,
}

impl EchoCommand {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }
}

impl Command for EchoCommand {
    const ALL: &'static [Self] = &[EchoCommand::Ping, EchoCommand::Echo, EchoCommand::Quit];

    fn name(&self) -> &'static str {
        match self {
            EchoCommand::Ping => "PING",
            EchoCommand::Echo => "ECHO",
            EchoCommand::Quit => "QUIT",
        }
    }
}

/// One echo connection.
#[derive(Debug)]
pub struct EchoHandler {
    config: EchoConfig,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    peer: Option<SocketAddr>,
    agent_id: Option<AgentId>,
}

impl EchoHandler {
    pub fn new(config: EchoConfig) -> Self {
        Self {
            config,
            reader: None,
            writer: None,
            peer: None,
            agent_id: None,
        }
    }
}

#[async_trait]
impl Handler for EchoHandler {
    type Command = EchoCommand;

    async fn setup(&mut self, endpoint: Endpoint) -> HandlerResult<()> {
        endpoint.stream.set_nodelay(true)?;
        let (reader, writer) = endpoint.stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.peer = Some(endpoint.peer);
        self.agent_id = Some(endpoint.agent_id);
        Ok(())
    }

    async fn run(&mut self, stop: CancellationToken) -> HandlerResult<()> {
        let (Some(reader), Some(writer)) = (self.reader.as_mut(), self.writer.as_mut()) else {
            return Err("echo handler used before setup".into());
        };
        let read_timeout = self.config.read_timeout;
        let write_timeout = self.config.write_timeout;

        loop {
            let frame = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                frame = tokio::time::timeout(read_timeout, read_frame(reader, self.config.max_frame_bytes)) => frame,
            };
            let (code, payload) = match frame {
                Err(_elapsed) => {
                    tracing::debug!(peer = ?self.peer, "Read timeout ({:?}), dropping connection", read_timeout);
                    return Ok(());
                }
                Ok(result) => match result? {
                    Some(f) => f,
                    None => return Ok(()), // clean EOF
                },
            };

            match EchoCommand::from_code(code) {
                Some(EchoCommand::Ping) => {
                    timed_write(writer, REPLY_PONG, &[], write_timeout).await?;
                }
                Some(EchoCommand::Echo) => {
                    timed_write(writer, REPLY_ECHO, &payload, write_timeout).await?;
                }
                Some(EchoCommand::Quit) => {
                    timed_write(writer, REPLY_BYE, &[], write_timeout).await?;
                    return Ok(());
                }
                None => {
                    let message = format!("Unknown command code: 0x{:02X}", code);
                    timed_write(writer, REPLY_ERROR, message.as_bytes(), write_timeout).await?;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(agent_id = ?self.agent_id, error = %e, "echo shutdown failed");
            }
        }
        self.reader.take();
    }
}

/// Builds [`EchoHandler`]s sharing one configuration.
#[derive(Debug, Clone, Default)]
pub struct EchoFactory {
    config: EchoConfig,
}

impl EchoFactory {
    pub fn new(config: EchoConfig) -> Self {
        Self { config }
    }
}

impl HandlerFactory for EchoFactory {
    type Handler = EchoHandler;

    fn create_handler(&self) -> EchoHandler {
        EchoHandler::new(self.config.clone())
    }
}
