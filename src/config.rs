//! Configuration loading and the per-component config structs.
//!
//! The on-disk file (`<config dir>/taskwire/config.json`) and the
//! `TASKWIRE_*` environment variables feed [`Config`], which then hands out
//! immutable [`ClientConfig`] / [`ServerConfig`] values. Components never
//! read global state after construction.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    CONNECT_TIMEOUT, LOCAL_RETRY_INTERVAL, LONG_REQUEST_TIMEOUT, MIN_WS_PORT,
    OUTBOUND_QUEUE_CAPACITY, REQUEST_TIMEOUT,
};
use crate::protocol::CommandName;

/// Host used when only a port is given.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Configuration mistakes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Both `socketPath` and `host`/`port` were given.
    #[error("specify either socketPath or host/port, not both")]
    BothTransports,
    /// Neither form was given.
    #[error("no transport configured: specify socketPath or host/port")]
    NoTransport,
    /// `host` without `port`.
    #[error("host {0:?} given without a port")]
    MissingPort(String),
    /// WebSocket port outside the allowed range.
    #[error("WebSocket port {0} is outside {MIN_WS_PORT}-65535")]
    InvalidWsPort(u16),
    /// An environment variable held an unparsable value.
    #[error("{name}={value:?} is not a valid number")]
    InvalidNumber {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Where the control channel lives: a local socket or a TCP endpoint.
///
/// On the wire this is `{"socketPath": ...}` or `{"host": ..., "port": ...}`;
/// supplying both is rejected at deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTransport", into = "RawTransport")]
pub enum TransportConfig {
    /// Unix domain socket at this path.
    Local {
        /// Socket file.
        socket_path: PathBuf,
    },
    /// TCP endpoint.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port; 0 lets a server pick an ephemeral port.
        port: u16,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    socket_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

impl TryFrom<RawTransport> for TransportConfig {
    type Error = ConfigError;

    fn try_from(raw: RawTransport) -> Result<Self, Self::Error> {
        Self::from_parts(raw.socket_path, raw.host, raw.port)
    }
}

impl From<TransportConfig> for RawTransport {
    fn from(config: TransportConfig) -> Self {
        match config {
            TransportConfig::Local { socket_path } => Self {
                socket_path: Some(socket_path),
                ..Self::default()
            },
            TransportConfig::Tcp { host, port } => Self {
                socket_path: None,
                host: Some(host),
                port: Some(port),
            },
        }
    }
}

impl TransportConfig {
    /// Local socket transport.
    pub fn local(socket_path: impl Into<PathBuf>) -> Self {
        Self::Local {
            socket_path: socket_path.into(),
        }
    }

    /// TCP transport.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Builds from optional parts, enforcing exactly one form.
    ///
    /// A port without a host binds/connects to [`DEFAULT_HOST`].
    pub fn from_parts(
        socket_path: Option<PathBuf>,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<Self, ConfigError> {
        match (socket_path, host, port) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ConfigError::BothTransports),
            (Some(socket_path), None, None) => Ok(Self::Local { socket_path }),
            (None, host, Some(port)) => Ok(Self::Tcp {
                host: host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port,
            }),
            (None, Some(host), None) => Err(ConfigError::MissingPort(host)),
            (None, None, None) => Err(ConfigError::NoTransport),
        }
    }

    /// Default local socket under the system temp dir.
    pub fn default_local() -> Self {
        Self::local(env::temp_dir().join("taskwire.sock"))
    }

    /// Human-readable endpoint for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Local { socket_path } => format!("unix:{}", socket_path.display()),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }
}

/// File and environment configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Control channel endpoint; the default local socket when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportConfig>,
    /// Connect + Ack deadline.
    pub connect_timeout_ms: u64,
    /// Deadline for short commands.
    pub request_timeout_ms: u64,
    /// Deadline for `StartNewTask` / `SendMessage`.
    pub long_request_timeout_ms: u64,
    /// Local socket connect retry interval.
    pub retry_interval_ms: u64,
    /// Port for the optional WebSocket binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: None,
            connect_timeout_ms: millis(CONNECT_TIMEOUT),
            request_timeout_ms: millis(REQUEST_TIMEOUT),
            long_request_timeout_ms: millis(LONG_REQUEST_TIMEOUT),
            retry_interval_ms: millis(LOCAL_RETRY_INTERVAL),
            ws_port: None,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `TASKWIRE_CONFIG_DIR` overrides the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = env::var("TASKWIRE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("taskwire"))
    }

    /// Loads `config.json` (if present), then applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads one config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Writes the config as pretty JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Applies `TASKWIRE_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let number = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| ConfigError::InvalidNumber { name, value })
                })
                .transpose()
        };
        let port = |name: &'static str| -> Result<Option<u16>, ConfigError> {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u16>()
                        .map_err(|_| ConfigError::InvalidNumber { name, value })
                })
                .transpose()
        };

        let socket_path = lookup("TASKWIRE_SOCKET_PATH").map(PathBuf::from);
        let host = lookup("TASKWIRE_HOST");
        let tcp_port = port("TASKWIRE_PORT")?;
        if socket_path.is_some() || host.is_some() || tcp_port.is_some() {
            self.transport = Some(TransportConfig::from_parts(socket_path, host, tcp_port)?);
        }

        if let Some(ms) = number("TASKWIRE_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = number("TASKWIRE_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = ms;
        }
        if let Some(ms) = number("TASKWIRE_LONG_REQUEST_TIMEOUT_MS")? {
            self.long_request_timeout_ms = ms;
        }
        if let Some(p) = port("TASKWIRE_WS_PORT")? {
            self.ws_port = Some(p);
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(p) = self.ws_port {
            if p < MIN_WS_PORT {
                return Err(ConfigError::InvalidWsPort(p));
            }
        }
        Ok(())
    }

    /// The configured transport, or the default local socket.
    pub fn transport(&self) -> TransportConfig {
        self.transport
            .clone()
            .unwrap_or_else(TransportConfig::default_local)
    }

    /// Immutable client settings.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            transport: self.transport(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            long_request_timeout: Duration::from_millis(self.long_request_timeout_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    /// Immutable server settings.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.transport())
    }
}

/// Settings a [`crate::Client`] is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Endpoint to connect to.
    pub transport: TransportConfig,
    /// Deadline for transport connect plus Ack.
    pub connect_timeout: Duration,
    /// Deadline for short commands.
    pub request_timeout: Duration,
    /// Deadline for long-running commands.
    pub long_request_timeout: Duration,
    /// Local socket retry interval.
    pub retry_interval: Duration,
}

impl ClientConfig {
    /// Default timeouts for `transport`.
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            long_request_timeout: LONG_REQUEST_TIMEOUT,
            retry_interval: LOCAL_RETRY_INTERVAL,
        }
    }

    /// Sets the connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets both request deadlines.
    pub fn with_request_timeouts(mut self, short: Duration, long: Duration) -> Self {
        self.request_timeout = short;
        self.long_request_timeout = long;
        self
    }

    /// Deadline for one command.
    pub fn timeout_for(&self, command: CommandName) -> Duration {
        if command.is_long_running() {
            self.long_request_timeout
        } else {
            self.request_timeout
        }
    }
}

/// Settings a [`crate::Server`] is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Endpoint to listen on.
    pub transport: TransportConfig,
    /// Per-connection outbound queue depth.
    pub outbound_queue_capacity: usize,
}

impl ServerConfig {
    /// Default limits for `transport`.
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}
