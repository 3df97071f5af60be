//! taskwire - typed command/event RPC for driving assistant task sessions.
//!
//! A server embedded next to a task engine accepts connections over a local
//! socket or TCP, hands every inbound command to a [`TaskApi`] and pushes
//! task lifecycle events back out. External processes drive it with a
//! [`Client`]: correlated request/response calls plus event subscriptions.
//!
//! # Architecture
//!
//! - **Protocol** - envelope, command and event types with strict validation
//! - **Transport** - TCP (newline framing) and local socket (node-ipc framing)
//! - **Server** - client registry, command dispatch, unicast and broadcast
//! - **Client** - readiness handshake, correlation, timeouts, subscriptions
//! - **WsServer** - optional WebSocket dialect over the same [`TaskApi`]
//!
//! # Modules
//!
//! - [`protocol`] - wire types and [`protocol::validate`]
//! - [`framing`] - stream framing codecs
//! - [`transport`] - the [`transport::Transport`] contract and listeners
//! - [`api`] - the handler table and the in-memory engine
//! - [`config`] - configuration loading

pub mod api;
pub mod client;
pub mod config;
pub mod constants;
pub mod framing;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod ws;
pub mod ws_server;

// Re-export commonly used types
pub use api::memory::InMemoryEngine;
pub use api::{ApiError, TaskApi};
pub use client::{Client, ClientError, ClientNotice};
pub use config::{ClientConfig, Config, ServerConfig, TransportConfig};
pub use protocol::{
    Ack, CommandName, CommandResponse, Envelope, EventName, SendMessage, StartNewTask,
    TaskCommand, TaskEvent,
};
pub use server::{Server, ServerEvent, ServerHandle};
pub use ws_server::WsServer;
