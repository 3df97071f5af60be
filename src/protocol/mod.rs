//! Wire protocol: envelopes, commands, events and their validation.
//!
//! Every message on the wire is one JSON [`Envelope`]:
//!
//! ```text
//! {"type":"TaskCommand","origin":"client","clientId":"3f9a0c11d2e4",
//!  "data":{"commandName":"IsReady","requestId":"3f9a0c11d2e4-1"}}
//!
//! {"type":"TaskEvent","origin":"server","relayClientId":"3f9a0c11d2e4",
//!  "data":{"eventName":"commandResponse",
//!          "payload":[{"commandName":"IsReady","requestId":"3f9a0c11d2e4-1","payload":true}]}}
//! ```
//!
//! `type` and `origin` together select the legal shape of `data`. Inbound
//! bytes are never interpreted without going through [`validate`] (or
//! [`parse_frame`], which decodes JSON first); anything that does not match
//! a known shape is a [`ValidationError`] and the frame is dropped by the
//! caller.

mod command;
mod envelope;
mod event;

pub use command::{CommandName, CommandRequest, SendMessage, StartNewTask, TaskCommand};
pub use envelope::{Ack, Envelope, MessageType, Origin};
pub use event::{
    ClineMessage, CommandResponse, EventName, MessageAction, MessageEvent, MessageKind,
    TaskEvent, TokenUsage, ToolUsage, ToolUsageEntry,
};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Why an inbound value was rejected.
///
/// `path` uses a dotted JSON path rooted at `$` (e.g. `$.data.commandName`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The frame was not valid JSON.
    #[error("malformed JSON: {0}")]
    Json(String),
    /// A value had the wrong JSON type.
    #[error("{path}: expected {expected}")]
    WrongType {
        /// Location of the offending value.
        path: String,
        /// Human-readable description of the expected type.
        expected: &'static str,
    },
    /// A required field was absent.
    #[error("{path}: missing required field")]
    Missing {
        /// Location of the missing field.
        path: String,
    },
    /// A discriminator held a value outside its closed set.
    #[error("{path}: unknown value {value:?}")]
    Unknown {
        /// Location of the discriminator.
        path: String,
        /// The rejected value.
        value: String,
    },
    /// `type` and `origin` are individually valid but not together.
    #[error("{message_type} envelopes are not legal with origin {origin}")]
    IllegalShape {
        /// Envelope type.
        message_type: MessageType,
        /// Envelope origin.
        origin: Origin,
    },
    /// A payload did not match the shape fixed by its discriminator.
    #[error("{path}: {reason}")]
    Payload {
        /// Location of the payload.
        path: String,
        /// Decoder message.
        reason: String,
    },
}

/// Validates an already-decoded JSON value as an [`Envelope`].
///
/// Pure: it only reads `raw`.
pub fn validate(raw: &Value) -> Result<Envelope, ValidationError> {
    Envelope::from_value(raw)
}

/// Decodes one text frame and validates it.
pub fn parse_frame(text: &str) -> Result<Envelope, ValidationError> {
    let raw: Value = serde_json::from_str(text).map_err(|e| ValidationError::Json(e.to_string()))?;
    validate(&raw)
}

// ----------------------------------------------------------------------------
// Shared field helpers
// ----------------------------------------------------------------------------

fn as_object<'a>(
    value: &'a Value,
    path: &str,
) -> Result<&'a serde_json::Map<String, Value>, ValidationError> {
    value.as_object().ok_or_else(|| ValidationError::WrongType {
        path: path.to_string(),
        expected: "object",
    })
}

fn required_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a str, ValidationError> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(ValidationError::Missing {
            path: format!("{path}.{key}"),
        }),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ValidationError::WrongType {
            path: format!("{path}.{key}"),
            expected: "string",
        }),
    }
}

fn optional_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<Option<&'a str>, ValidationError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ValidationError::WrongType {
            path: format!("{path}.{key}"),
            expected: "string",
        }),
    }
}

fn decode<T: DeserializeOwned>(value: &Value, path: &str) -> Result<T, ValidationError> {
    T::deserialize(value).map_err(|e| ValidationError::Payload {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_frame_rejects_malformed_json() {
        let err = parse_frame("{\"type\":").unwrap_err();
        assert!(matches!(err, ValidationError::Json(_)), "got {err:?}");
    }

    #[test]
    fn test_validate_rejects_non_object() {
        let err = validate(&json!([1, 2, 3])).unwrap_err();
        assert_eq!(
            err,
            ValidationError::WrongType {
                path: "$".to_string(),
                expected: "object"
            }
        );
    }

    #[test]
    fn test_validation_error_display_names_path() {
        let err = ValidationError::Missing {
            path: "$.data.commandName".to_string(),
        };
        assert_eq!(err.to_string(), "$.data.commandName: missing required field");
    }
}
