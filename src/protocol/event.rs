//! Task events: lifecycle notifications and command replies.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use super::{as_object, decode, required_str, CommandName, ValidationError};

/// Event discriminator (camelCase on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs, reason = "variant names mirror the wire names")]
pub enum EventName {
    Message,
    TaskCreated,
    TaskStarted,
    TaskModeSwitched,
    TaskPaused,
    TaskUnpaused,
    TaskAskResponded,
    TaskAborted,
    TaskSpawned,
    TaskCompleted,
    TaskTokenUsageUpdated,
    TaskToolFailed,
    CommandResponse,
}

impl EventName {
    /// Every event, in declaration order.
    pub const ALL: [Self; 13] = [
        Self::Message,
        Self::TaskCreated,
        Self::TaskStarted,
        Self::TaskModeSwitched,
        Self::TaskPaused,
        Self::TaskUnpaused,
        Self::TaskAskResponded,
        Self::TaskAborted,
        Self::TaskSpawned,
        Self::TaskCompleted,
        Self::TaskTokenUsageUpdated,
        Self::TaskToolFailed,
        Self::CommandResponse,
    ];

    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::TaskCreated => "taskCreated",
            Self::TaskStarted => "taskStarted",
            Self::TaskModeSwitched => "taskModeSwitched",
            Self::TaskPaused => "taskPaused",
            Self::TaskUnpaused => "taskUnpaused",
            Self::TaskAskResponded => "taskAskResponded",
            Self::TaskAborted => "taskAborted",
            Self::TaskSpawned => "taskSpawned",
            Self::TaskCompleted => "taskCompleted",
            Self::TaskTokenUsageUpdated => "taskTokenUsageUpdated",
            Self::TaskToolFailed => "taskToolFailed",
            Self::CommandResponse => "commandResponse",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| ValidationError::Unknown {
                path: "$.data.eventName".to_string(),
                value: s.to_string(),
            })
    }
}

/// Token accounting for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Input tokens across all requests.
    pub total_tokens_in: u64,
    /// Output tokens across all requests.
    pub total_tokens_out: u64,
    /// Prompt cache writes, when the provider reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cache_writes: Option<u64>,
    /// Prompt cache reads, when the provider reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cache_reads: Option<u64>,
    /// Cost in USD.
    pub total_cost: f64,
    /// Size of the current context window.
    pub context_tokens: u64,
}

/// Attempts and failures for one tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsageEntry {
    /// Times the tool was invoked.
    pub attempts: u64,
    /// Times it failed.
    pub failures: u64,
}

/// Per-tool usage, keyed by tool name.
pub type ToolUsage = BTreeMap<String, ToolUsageEntry>;

/// Whether a chat message is a question to the user or a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// The engine needs a reply.
    Ask,
    /// Informational.
    Say,
}

/// One chat message in a task's transcript.
///
/// Fields this crate does not model are kept in `extra` so they survive a
/// relay unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClineMessage {
    /// Milliseconds since the epoch; doubles as the message id.
    pub ts: i64,
    /// Ask or say.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Ask subtype (`followup`, `command`, `completion_result`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<String>,
    /// Say subtype (`text`, `api_req_started`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub say: Option<String>,
    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Attached images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    /// Still streaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    /// Model reasoning, if exposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Everything else.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClineMessage {
    /// A `say: text` message.
    pub fn say_text(ts: i64, text: impl Into<String>) -> Self {
        Self {
            ts,
            kind: MessageKind::Say,
            ask: None,
            say: Some("text".to_string()),
            text: Some(text.into()),
            images: None,
            partial: None,
            reasoning: None,
            extra: Map::new(),
        }
    }
}

/// Whether a message event introduces or updates a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAction {
    /// New message.
    Created,
    /// Streaming update of an existing message (same `ts`).
    Updated,
}

/// Payload of the `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    /// Task the message belongs to.
    pub task_id: String,
    /// Created or updated.
    pub action: MessageAction,
    /// The message.
    pub message: ClineMessage,
}

/// Reply to a command, carried as a `commandResponse` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    /// Command being answered.
    pub command_name: CommandName,
    /// Correlation id copied from the request.
    pub request_id: String,
    /// Result on success. Present-but-null is kept as `Some(Null)`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload: Option<Value>,
    /// Failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl CommandResponse {
    /// Successful reply.
    pub fn success(command_name: CommandName, request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            command_name,
            request_id: request_id.into(),
            payload: Some(payload),
            error: None,
        }
    }

    /// Failed reply.
    pub fn failure(
        command_name: CommandName,
        request_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            command_name,
            request_id: request_id.into(),
            payload: None,
            error: Some(error.into()),
        }
    }

    /// Collapses the reply into a result.
    ///
    /// A top-level `error` wins; a payload object of the form
    /// `{"error": "..."}` is also treated as a failure.
    pub fn into_result(self) -> Result<Value, String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        match self.payload {
            Some(Value::Object(obj)) if obj.len() == 1 && obj.get("error").is_some_and(Value::is_string) => {
                Err(obj["error"].as_str().unwrap_or_default().to_string())
            }
            Some(payload) => Ok(payload),
            None => Ok(Value::Null),
        }
    }
}

/// A task lifecycle notification or command reply.
///
/// Payloads are positional on the wire (`"payload": [taskId, ...]`).
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A chat message was created or updated.
    Message(MessageEvent),
    /// `[taskId]`
    TaskCreated(String),
    /// `[taskId]`
    TaskStarted(String),
    /// `[taskId, mode]`
    TaskModeSwitched(String, String),
    /// `[taskId]`
    TaskPaused(String),
    /// `[taskId]`
    TaskUnpaused(String),
    /// `[taskId]`
    TaskAskResponded(String),
    /// `[taskId]`
    TaskAborted(String),
    /// `[taskId, childTaskId]`
    TaskSpawned(String, String),
    /// `[taskId, tokenUsage, toolUsage]`
    TaskCompleted(String, TokenUsage, ToolUsage),
    /// `[taskId, tokenUsage]`
    TaskTokenUsageUpdated(String, TokenUsage),
    /// `[taskId, toolName, error]`
    TaskToolFailed(String, String, String),
    /// Reply to a prior command.
    CommandResponse(CommandResponse),
}

impl TaskEvent {
    /// The discriminator for this event.
    pub fn name(&self) -> EventName {
        match self {
            Self::Message(_) => EventName::Message,
            Self::TaskCreated(_) => EventName::TaskCreated,
            Self::TaskStarted(_) => EventName::TaskStarted,
            Self::TaskModeSwitched(..) => EventName::TaskModeSwitched,
            Self::TaskPaused(_) => EventName::TaskPaused,
            Self::TaskUnpaused(_) => EventName::TaskUnpaused,
            Self::TaskAskResponded(_) => EventName::TaskAskResponded,
            Self::TaskAborted(_) => EventName::TaskAborted,
            Self::TaskSpawned(..) => EventName::TaskSpawned,
            Self::TaskCompleted(..) => EventName::TaskCompleted,
            Self::TaskTokenUsageUpdated(..) => EventName::TaskTokenUsageUpdated,
            Self::TaskToolFailed(..) => EventName::TaskToolFailed,
            Self::CommandResponse(_) => EventName::CommandResponse,
        }
    }

    /// Task the event concerns, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Message(m) => Some(&m.task_id),
            Self::TaskCreated(id)
            | Self::TaskStarted(id)
            | Self::TaskModeSwitched(id, _)
            | Self::TaskPaused(id)
            | Self::TaskUnpaused(id)
            | Self::TaskAskResponded(id)
            | Self::TaskAborted(id)
            | Self::TaskSpawned(id, _)
            | Self::TaskCompleted(id, ..)
            | Self::TaskTokenUsageUpdated(id, _)
            | Self::TaskToolFailed(id, ..) => Some(id),
            Self::CommandResponse(_) => None,
        }
    }

    /// The positional `payload` array.
    pub fn payload(&self) -> Value {
        match self {
            Self::Message(m) => json!([m]),
            Self::TaskCreated(id)
            | Self::TaskStarted(id)
            | Self::TaskPaused(id)
            | Self::TaskUnpaused(id)
            | Self::TaskAskResponded(id)
            | Self::TaskAborted(id) => json!([id]),
            Self::TaskModeSwitched(id, other) | Self::TaskSpawned(id, other) => json!([id, other]),
            Self::TaskCompleted(id, tokens, tools) => json!([id, tokens, tools]),
            Self::TaskTokenUsageUpdated(id, tokens) => json!([id, tokens]),
            Self::TaskToolFailed(id, tool, error) => json!([id, tool, error]),
            Self::CommandResponse(r) => json!([r]),
        }
    }

    /// Wire representation: `{eventName, payload}`.
    pub fn to_value(&self) -> Value {
        json!({ "eventName": self.name().as_str(), "payload": self.payload() })
    }

    /// Rebuilds an event from its discriminator and positional payload.
    pub fn from_parts(name: EventName, payload: &Value) -> Result<Self, ValidationError> {
        const PATH: &str = "$.data.payload";
        Ok(match name {
            EventName::Message => Self::Message(decode::<(MessageEvent,)>(payload, PATH)?.0),
            EventName::TaskCreated => Self::TaskCreated(decode::<(String,)>(payload, PATH)?.0),
            EventName::TaskStarted => Self::TaskStarted(decode::<(String,)>(payload, PATH)?.0),
            EventName::TaskModeSwitched => {
                let (id, mode) = decode(payload, PATH)?;
                Self::TaskModeSwitched(id, mode)
            }
            EventName::TaskPaused => Self::TaskPaused(decode::<(String,)>(payload, PATH)?.0),
            EventName::TaskUnpaused => Self::TaskUnpaused(decode::<(String,)>(payload, PATH)?.0),
            EventName::TaskAskResponded => {
                Self::TaskAskResponded(decode::<(String,)>(payload, PATH)?.0)
            }
            EventName::TaskAborted => Self::TaskAborted(decode::<(String,)>(payload, PATH)?.0),
            EventName::TaskSpawned => {
                let (id, child) = decode(payload, PATH)?;
                Self::TaskSpawned(id, child)
            }
            EventName::TaskCompleted => {
                let (id, tokens, tools) = decode(payload, PATH)?;
                Self::TaskCompleted(id, tokens, tools)
            }
            EventName::TaskTokenUsageUpdated => {
                let (id, tokens) = decode(payload, PATH)?;
                Self::TaskTokenUsageUpdated(id, tokens)
            }
            EventName::TaskToolFailed => {
                let (id, tool, error) = decode(payload, PATH)?;
                Self::TaskToolFailed(id, tool, error)
            }
            EventName::CommandResponse => {
                Self::CommandResponse(decode::<(CommandResponse,)>(payload, PATH)?.0)
            }
        })
    }

    pub(super) fn from_value(value: &Value, path: &str) -> Result<Self, ValidationError> {
        let obj = as_object(value, path)?;
        let name: EventName = required_str(obj, "eventName", path)?.parse()?;
        let payload = obj.get("payload").ok_or_else(|| ValidationError::Missing {
            path: format!("{path}.payload"),
        })?;
        Self::from_parts(name, payload)
    }
}

impl Serialize for TaskEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{validate, Envelope};

    fn event_envelope(data: Value) -> Value {
        json!({"type": "TaskEvent", "origin": "server", "data": data})
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            total_tokens_in: 1200,
            total_tokens_out: 340,
            total_cache_writes: Some(10),
            total_cache_reads: None,
            total_cost: 0.5,
            context_tokens: 1540,
        }
    }

    #[test]
    fn test_task_started_wire_shape() {
        let value = TaskEvent::TaskStarted("task-1".into()).to_value();
        assert_eq!(value, json!({"eventName": "taskStarted", "payload": ["task-1"]}));
    }

    #[test]
    fn test_events_round_trip() {
        let mut tools = ToolUsage::new();
        tools.insert(
            "read_file".into(),
            ToolUsageEntry {
                attempts: 3,
                failures: 1,
            },
        );
        let mut message = ClineMessage::say_text(1_700_000_000_000, "hello");
        message.extra.insert("progressStatus".into(), json!({"icon": "check"}));

        let events = vec![
            TaskEvent::Message(MessageEvent {
                task_id: "t".into(),
                action: MessageAction::Created,
                message,
            }),
            TaskEvent::TaskModeSwitched("t".into(), "architect".into()),
            TaskEvent::TaskSpawned("t".into(), "child".into()),
            TaskEvent::TaskCompleted("t".into(), usage(), tools),
            TaskEvent::TaskTokenUsageUpdated("t".into(), usage()),
            TaskEvent::TaskToolFailed("t".into(), "execute_command".into(), "exit 1".into()),
            TaskEvent::CommandResponse(CommandResponse::success(
                CommandName::GetConfiguration,
                "c-1",
                Value::Null,
            )),
        ];
        for event in events {
            let env = Envelope::event(event);
            assert_eq!(validate(&env.to_value()).unwrap(), env);
        }
    }

    #[test]
    fn test_unknown_event_name_rejected() {
        let raw = event_envelope(json!({"eventName": "taskExploded", "payload": ["t"]}));
        assert!(matches!(
            validate(&raw).unwrap_err(),
            ValidationError::Unknown { .. }
        ));
    }

    #[test]
    fn test_wrong_payload_arity_rejected() {
        let raw = event_envelope(json!({"eventName": "taskSpawned", "payload": ["only-one"]}));
        assert!(matches!(
            validate(&raw).unwrap_err(),
            ValidationError::Payload { .. }
        ));

        let raw = event_envelope(json!({"eventName": "taskStarted", "payload": ["a", "b"]}));
        assert!(validate(&raw).is_err());

        let raw = event_envelope(json!({"eventName": "taskStarted"}));
        assert!(matches!(
            validate(&raw).unwrap_err(),
            ValidationError::Missing { .. }
        ));
    }

    #[test]
    fn test_command_response_into_result() {
        let ok = CommandResponse::success(CommandName::IsReady, "r", json!(true));
        assert_eq!(ok.into_result(), Ok(json!(true)));

        let failed = CommandResponse::failure(CommandName::CancelTask, "r", "no such task");
        assert_eq!(failed.into_result(), Err("no such task".to_string()));

        let nested = CommandResponse::success(
            CommandName::StartNewTask,
            "r",
            json!({"error": "provider not configured"}),
        );
        assert_eq!(nested.into_result(), Err("provider not configured".to_string()));

        let object = CommandResponse::success(
            CommandName::GetConfiguration,
            "r",
            json!({"error": "x", "mode": "code"}),
        );
        assert!(object.into_result().is_ok());
    }

    #[test]
    fn test_command_response_with_unknown_command_rejected() {
        let raw = event_envelope(json!({
            "eventName": "commandResponse",
            "payload": [{"commandName": "Nope", "requestId": "r"}]
        }));
        assert!(validate(&raw).is_err());
    }
}
