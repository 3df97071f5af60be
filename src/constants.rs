//! Protocol-wide constants for taskwire.
//!
//! Timeouts, retry intervals and buffer limits live here so the server,
//! client and transports agree on them. Configuration values in
//! [`crate::config`] default to these.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// How long `connect()` waits for the transport and the server's Ack.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for short commands (getters, button presses, profile calls).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for long-running commands.
///
/// `StartNewTask` and `SendMessage` block until the engine has accepted the
/// input, which can involve spinning up a task and its first API call.
pub const LONG_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between local socket connection attempts.
///
/// Matches the node-ipc default so a Rust client behaves like the peer
/// library when the server has not created its socket yet.
pub const LOCAL_RETRY_INTERVAL: Duration = Duration::from_millis(1500);

// ============================================================================
// Limits
// ============================================================================

/// Maximum size of a single decoded frame (16 MiB).
///
/// Message events can carry base64 images, so this is generous; anything
/// larger is discarded up to the next delimiter.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Per-connection outbound queue depth on the server.
///
/// When a stalled client lets this fill up, further messages to it are
/// dropped instead of growing memory without bound.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the server's local notification channel.
pub const SERVER_EVENT_CAPACITY: usize = 256;

/// Read buffer size for socket reads.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Maximum Unix socket path length (macOS `sun_path` is 104 bytes).
pub const MAX_SOCKET_PATH_LEN: usize = 104;

// ============================================================================
// WebSocket binding
// ============================================================================

/// Default port for the WebSocket binding.
pub const DEFAULT_WS_PORT: u16 = 7800;

/// Lowest port the WebSocket binding accepts.
pub const MIN_WS_PORT: u16 = 1024;

/// Request id used for the greeting sent when a WebSocket client connects.
pub const WS_WELCOME_REQUEST_ID: &str = "welcome";
