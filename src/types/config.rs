//! Configuration structures.
//!
//! Configuration is loaded from a TOML file and then overridden by
//! `NETHARNESS_*` environment variables.

use serde::de::IntoDeserializer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::{Error, Result};

/// Global harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Echo protocol configuration (used by the bundled reference handler).
    #[serde(default)]
    pub echo: EchoConfig,
}

impl Config {
    /// Parse configuration from TOML text. Missing sections use defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid TOML: {e}")))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Apply `NETHARNESS_BIND_HOST`, `NETHARNESS_STOP_TIMEOUT` and
    /// `NETHARNESS_LOG_LEVEL` on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("NETHARNESS_BIND_HOST") {
            self.server.bind_host = host;
        }
        if let Some(raw) = lookup("NETHARNESS_STOP_TIMEOUT") {
            self.server.stop_timeout = parse_duration(&raw)
                .map_err(|e| Error::config(format!("NETHARNESS_STOP_TIMEOUT={raw}: {e}")))?;
        }
        if let Some(level) = lookup("NETHARNESS_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        Ok(())
    }
}

fn parse_duration(raw: &str) -> std::result::Result<Duration, serde::de::value::Error> {
    let de: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
        raw.into_deserializer();
    humantime_serde::deserialize(de)
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host or IP the listening socket binds to. The port comes from `listen()`.
    pub bind_host: String,

    /// Upper bound on how long shutdown waits for a single worker to join.
    /// Workers still running afterwards are aborted and reported.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Capacity of the server event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            stop_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Echo protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EchoConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Connections idle beyond this duration are dropped.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Slow consumers that cannot accept a reply within this window are dropped.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
        }
    }
}
