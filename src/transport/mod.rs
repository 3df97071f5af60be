//! Client-side transports and the server-side listener.
//!
//! A [`Transport`] hides the socket technology behind one contract:
//!
//! ```text
//!   connect(timeout) ──► Ok / TransportError
//!   send(json)       ──► queued, or NotConnected
//!   disconnect()
//!   is_connected()
//!
//!   events: Data(frame) ─ Error(msg) ─ Close      (Close at most once per connection)
//! ```
//!
//! Framing is the transport's job: `Data` always carries exactly one
//! complete envelope's JSON text, so the client never sees partial reads.

mod link;
mod listener;
#[cfg(unix)]
mod local;
mod tcp;

pub use listener::{Accepted, BoxReader, BoxWriter, Endpoint, Listener};
#[cfg(unix)]
pub use local::LocalTransport;
pub use tcp::TcpTransport;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::TransportConfig;

/// Something that happened on a transport after `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete frame (envelope JSON text).
    Data(String),
    /// A non-fatal error; the connection may still be usable.
    Error(String),
    /// The connection ended. Emitted at most once per connection.
    Close,
}

/// Transport failures surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// `send` while not connected.
    #[error("not connected")]
    NotConnected,
    /// `connect` did not complete within its deadline.
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    Timeout {
        /// Endpoint description.
        endpoint: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },
    /// The connection attempt failed before the deadline.
    #[error("connect to {endpoint} failed: {reason}")]
    Connect {
        /// Endpoint description.
        endpoint: String,
        /// OS error text.
        reason: String,
    },
    /// The transport kind is not available on this platform.
    #[error("{0} transport is not supported on this platform")]
    Unsupported(&'static str),
}

/// Uniform connection contract over TCP and local sockets.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Opens the connection, failing after `timeout`.
    ///
    /// On timeout the in-flight attempt is cancelled and any partial socket
    /// is dropped. Connecting an already connected transport is a no-op.
    async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Queues one serialized envelope for delivery.
    fn send(&self, json: &str) -> Result<(), TransportError>;

    /// Closes the connection. Emits `Close` if it was open.
    async fn disconnect(&mut self);

    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;

    /// Hands out the event stream. Returns `None` after the first call.
    ///
    /// The stream spans reconnects: every connection's events arrive on it.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Endpoint description for logs and errors.
    fn endpoint(&self) -> String;
}

/// Builds the transport named by `config`.
pub fn from_config(
    config: &TransportConfig,
    retry_interval: Duration,
) -> Result<Box<dyn Transport>, TransportError> {
    match config {
        TransportConfig::Tcp { host, port } => Ok(Box::new(TcpTransport::new(host.clone(), *port))),
        #[cfg(unix)]
        TransportConfig::Local { socket_path } => Ok(Box::new(
            LocalTransport::new(socket_path.clone()).with_retry_interval(retry_interval),
        )),
        #[cfg(not(unix))]
        TransportConfig::Local { .. } => {
            let _ = retry_interval;
            Err(TransportError::Unsupported("local socket"))
        }
    }
}
