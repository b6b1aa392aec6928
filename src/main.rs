//! Echo server entry point.
//!
//! Runs the harness with the bundled echo protocol until Ctrl-C, then shuts
//! down every live connection and logs the shutdown report.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;

use netharness::protocol::EchoFactory;
use netharness::{Config, Server, ServerEvent};

#[derive(Debug, Parser)]
#[command(name = "netharness-echo", about = "TCP echo server on the netharness core")]
struct Cli {
    /// Port to listen on (0 picks an ephemeral port).
    #[arg(short, long, env = "NETHARNESS_PORT", default_value_t = 7878)]
    port: u16,

    /// Host or IP to bind; overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// TOML configuration file.
    #[arg(short, long, env = "NETHARNESS_CONFIG")]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> netharness::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides()?;
    if let Some(host) = &cli.host {
        config.server.bind_host = host.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    netharness::observability::init_tracing(&config.observability);

    let server = Server::new(EchoFactory::new(config.echo.clone()), config.server.clone());
    let mut events = server.subscribe();

    let addr = match server.listen(cli.port).await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "server failed to start");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(%addr, commands = ?server.commands(), "echo server ready");

    let log_events = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "server event log lagging");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match &event {
                ServerEvent::AcceptLoopEnded { error: Some(error) } => {
                    tracing::error!(%error, "accept loop ended unexpectedly");
                }
                ServerEvent::AgentDone { agent_id, peer, outcome } => {
                    if let Some(error) = outcome.to_error() {
                        tracing::warn!(%agent_id, %peer, %error, "connection failed");
                    }
                }
                ServerEvent::Closed { .. } => break,
                _ => match serde_json::to_string(&event) {
                    Ok(json) => tracing::debug!(event = %json, "server event"),
                    Err(e) => tracing::warn!(error = %e, "unserializable server event"),
                },
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }

    tracing::info!("shutdown requested");
    let report = server.close().await;
    let _ = log_events.await;

    if report.is_clean() {
        tracing::info!(stopped = report.stopped, "shutdown complete");
    } else {
        tracing::warn!(
            stopped = report.stopped,
            stragglers = ?report.stragglers,
            "shutdown complete with stragglers"
        );
    }
    ExitCode::SUCCESS
}
