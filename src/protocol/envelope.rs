//! The top-level wire object.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};

use super::{
    as_object, decode, optional_str, required_str, CommandRequest, TaskCommand, TaskEvent,
    ValidationError,
};

/// Envelope `type` discriminator.
///
/// `Connect` and `Disconnect` exist for local server notifications; they are
/// never legal on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Transport connected (local only).
    Connect,
    /// Transport closed (local only).
    Disconnect,
    /// Server handshake carrying the client's id.
    Ack,
    /// Client request.
    TaskCommand,
    /// Server notification or command reply.
    TaskEvent,
}

impl MessageType {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::Ack => "Ack",
            Self::TaskCommand => "TaskCommand",
            Self::TaskEvent => "TaskEvent",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Connect" => Ok(Self::Connect),
            "Disconnect" => Ok(Self::Disconnect),
            "Ack" => Ok(Self::Ack),
            "TaskCommand" => Ok(Self::TaskCommand),
            "TaskEvent" => Ok(Self::TaskEvent),
            other => Err(ValidationError::Unknown {
                path: "$.type".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Which side produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Sent by a client.
    Client,
    /// Sent by the server.
    Server,
}

impl Origin {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            other => Err(ValidationError::Unknown {
                path: "$.origin".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Handshake payload sent once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Identity assigned to the connection.
    pub client_id: String,
    /// Server process id.
    pub pid: u32,
    /// Server parent process id.
    pub ppid: u32,
}

impl Ack {
    /// Builds an Ack stamped with this process's identity.
    pub fn for_current_process(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            pid: std::process::id(),
            ppid: parent_pid(),
        }
    }
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}

/// A validated wire message.
///
/// Only the three legal `(type, origin)` combinations are representable.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// `(Ack, server)`.
    Ack(Ack),
    /// `(TaskCommand, client)`.
    TaskCommand {
        /// Sender's id as claimed by the client.
        client_id: String,
        /// The command and its correlation id.
        request: CommandRequest,
    },
    /// `(TaskEvent, server)`.
    TaskEvent {
        /// Set when the event is a targeted relay rather than a broadcast.
        relay_client_id: Option<String>,
        /// The event.
        event: TaskEvent,
    },
}

impl Envelope {
    /// Server handshake.
    pub fn ack(ack: Ack) -> Self {
        Self::Ack(ack)
    }

    /// Client command with a correlation id.
    pub fn command(
        client_id: impl Into<String>,
        request_id: impl Into<String>,
        command: TaskCommand,
    ) -> Self {
        Self::TaskCommand {
            client_id: client_id.into(),
            request: CommandRequest::new(request_id, command),
        }
    }

    /// Broadcast event.
    pub fn event(event: TaskEvent) -> Self {
        Self::TaskEvent {
            relay_client_id: None,
            event,
        }
    }

    /// Event relayed to one client.
    pub fn relay(client_id: impl Into<String>, event: TaskEvent) -> Self {
        Self::TaskEvent {
            relay_client_id: Some(client_id.into()),
            event,
        }
    }

    /// Envelope `type`.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ack(_) => MessageType::Ack,
            Self::TaskCommand { .. } => MessageType::TaskCommand,
            Self::TaskEvent { .. } => MessageType::TaskEvent,
        }
    }

    /// Envelope `origin`.
    pub fn origin(&self) -> Origin {
        match self {
            Self::TaskCommand { .. } => Origin::Client,
            Self::Ack(_) | Self::TaskEvent { .. } => Origin::Server,
        }
    }

    /// Wire representation.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), json!(self.message_type().as_str()));
        obj.insert("origin".into(), json!(self.origin().as_str()));
        match self {
            Self::Ack(ack) => {
                obj.insert(
                    "data".into(),
                    json!({ "clientId": ack.client_id, "pid": ack.pid, "ppid": ack.ppid }),
                );
            }
            Self::TaskCommand { client_id, request } => {
                obj.insert("clientId".into(), json!(client_id));
                obj.insert("data".into(), request.to_value());
            }
            Self::TaskEvent {
                relay_client_id,
                event,
            } => {
                if let Some(id) = relay_client_id {
                    obj.insert("relayClientId".into(), json!(id));
                }
                obj.insert("data".into(), event.to_value());
            }
        }
        Value::Object(obj)
    }

    /// Serializes to a single line of JSON (no delimiter).
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    pub(super) fn from_value(raw: &Value) -> Result<Self, ValidationError> {
        let obj = as_object(raw, "$")?;
        let message_type: MessageType = required_str(obj, "type", "$")?.parse()?;
        let origin: Origin = required_str(obj, "origin", "$")?.parse()?;
        let data = obj.get("data").unwrap_or(&Value::Null);

        match (message_type, origin) {
            (MessageType::Ack, Origin::Server) => Ok(Self::Ack(decode(data, "$.data")?)),
            (MessageType::TaskCommand, Origin::Client) => {
                let client_id = required_str(obj, "clientId", "$")?.to_string();
                let request = CommandRequest::from_value(data, "$.data")?;
                Ok(Self::TaskCommand { client_id, request })
            }
            (MessageType::TaskEvent, Origin::Server) => {
                let relay_client_id = optional_str(obj, "relayClientId", "$")?.map(str::to_string);
                let event = TaskEvent::from_value(data, "$.data")?;
                Ok(Self::TaskEvent {
                    relay_client_id,
                    event,
                })
            }
            (message_type, origin) => Err(ValidationError::IllegalShape {
                message_type,
                origin,
            }),
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse_frame, validate};

    #[test]
    fn test_ack_round_trip() {
        let env = Envelope::ack(Ack {
            client_id: "a1b2c3d4e5f6".to_string(),
            pid: 42,
            ppid: 1,
        });
        let text = env.encode();
        assert!(text.contains("\"type\":\"Ack\""));
        assert!(text.contains("\"origin\":\"server\""));
        assert_eq!(parse_frame(&text).unwrap(), env);
    }

    #[test]
    fn test_ack_for_current_process() {
        let ack = Ack::for_current_process("abc");
        assert_eq!(ack.client_id, "abc");
        assert_eq!(ack.pid, std::process::id());
    }

    #[test]
    fn test_relay_event_keeps_relay_id() {
        let env = Envelope::relay("abc", TaskEvent::TaskStarted("task-1".to_string()));
        let value = env.to_value();
        assert_eq!(value["relayClientId"], "abc");
        assert_eq!(validate(&value).unwrap(), env);
    }

    #[test]
    fn test_broadcast_event_omits_relay_id() {
        let value = Envelope::event(TaskEvent::TaskAborted("t".to_string())).to_value();
        assert!(value.get("relayClientId").is_none());
    }

    #[test]
    fn test_illegal_type_origin_combinations() {
        let cases = [
            json!({"type": "Ack", "origin": "client", "data": {"clientId": "x", "pid": 1, "ppid": 1}}),
            json!({"type": "TaskCommand", "origin": "server", "clientId": "x",
                   "data": {"commandName": "IsReady"}}),
            json!({"type": "TaskEvent", "origin": "client",
                   "data": {"eventName": "taskStarted", "payload": ["t"]}}),
            json!({"type": "Connect", "origin": "server", "data": {}}),
            json!({"type": "Disconnect", "origin": "client", "data": {}}),
        ];
        for raw in cases {
            let err = validate(&raw).unwrap_err();
            assert!(
                matches!(err, ValidationError::IllegalShape { .. }),
                "expected IllegalShape for {raw}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_unknown_type_and_origin_rejected() {
        let err = validate(&json!({"type": "Ping", "origin": "server"})).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Unknown {
                path: "$.type".to_string(),
                value: "Ping".to_string()
            }
        );

        let err = validate(&json!({"type": "Ack", "origin": "relay"})).unwrap_err();
        assert!(matches!(err, ValidationError::Unknown { ref path, .. } if path == "$.origin"));
    }

    #[test]
    fn test_command_requires_client_id() {
        let raw = json!({"type": "TaskCommand", "origin": "client",
                         "data": {"commandName": "IsReady", "requestId": "r1"}});
        let err = validate(&raw).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Missing {
                path: "$.clientId".to_string()
            }
        );
    }

    #[test]
    fn test_ack_with_missing_pid_rejected() {
        let raw = json!({"type": "Ack", "origin": "server", "data": {"clientId": "x"}});
        let err = validate(&raw).unwrap_err();
        assert!(matches!(err, ValidationError::Payload { .. }), "got {err:?}");
    }

    #[test]
    fn test_envelope_serialize_matches_to_value() {
        let env = Envelope::command("c", "c-1", TaskCommand::IsReady);
        assert_eq!(serde_json::to_value(&env).unwrap(), env.to_value());
    }
}
