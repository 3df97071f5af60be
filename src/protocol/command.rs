//! Task commands: the closed set of requests a client can make.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{as_object, decode, optional_str, required_str, ValidationError};

/// Command discriminator, spelled on the wire exactly as the variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs, reason = "variant names are the wire names")]
pub enum CommandName {
    StartNewTask,
    CancelTask,
    CloseTask,
    GetCurrentTaskStack,
    ClearCurrentTask,
    CancelCurrentTask,
    SendMessage,
    PressPrimaryButton,
    PressSecondaryButton,
    SetConfiguration,
    GetConfiguration,
    IsReady,
    GetMessages,
    GetTokenUsage,
    Log,
    ResumeTask,
    IsTaskInHistory,
    CreateProfile,
    GetProfiles,
    SetActiveProfile,
    GetActiveProfile,
    DeleteProfile,
}

impl CommandName {
    /// Every command, in declaration order.
    pub const ALL: [Self; 22] = [
        Self::StartNewTask,
        Self::CancelTask,
        Self::CloseTask,
        Self::GetCurrentTaskStack,
        Self::ClearCurrentTask,
        Self::CancelCurrentTask,
        Self::SendMessage,
        Self::PressPrimaryButton,
        Self::PressSecondaryButton,
        Self::SetConfiguration,
        Self::GetConfiguration,
        Self::IsReady,
        Self::GetMessages,
        Self::GetTokenUsage,
        Self::Log,
        Self::ResumeTask,
        Self::IsTaskInHistory,
        Self::CreateProfile,
        Self::GetProfiles,
        Self::SetActiveProfile,
        Self::GetActiveProfile,
        Self::DeleteProfile,
    ];

    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartNewTask => "StartNewTask",
            Self::CancelTask => "CancelTask",
            Self::CloseTask => "CloseTask",
            Self::GetCurrentTaskStack => "GetCurrentTaskStack",
            Self::ClearCurrentTask => "ClearCurrentTask",
            Self::CancelCurrentTask => "CancelCurrentTask",
            Self::SendMessage => "SendMessage",
            Self::PressPrimaryButton => "PressPrimaryButton",
            Self::PressSecondaryButton => "PressSecondaryButton",
            Self::SetConfiguration => "SetConfiguration",
            Self::GetConfiguration => "GetConfiguration",
            Self::IsReady => "IsReady",
            Self::GetMessages => "GetMessages",
            Self::GetTokenUsage => "GetTokenUsage",
            Self::Log => "Log",
            Self::ResumeTask => "ResumeTask",
            Self::IsTaskInHistory => "IsTaskInHistory",
            Self::CreateProfile => "CreateProfile",
            Self::GetProfiles => "GetProfiles",
            Self::SetActiveProfile => "SetActiveProfile",
            Self::GetActiveProfile => "GetActiveProfile",
            Self::DeleteProfile => "DeleteProfile",
        }
    }

    /// camelCase spelling used by the WebSocket binding (`startNewTask`).
    pub fn ws_name(self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
            None => String::new(),
        }
    }

    /// Looks up a command by its WebSocket spelling.
    pub fn from_ws_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.ws_name() == name)
    }

    /// Commands that may take much longer than a getter to answer.
    pub fn is_long_running(self) -> bool {
        matches!(self, Self::StartNewTask | Self::SendMessage)
    }

    /// Whether the engine answers this command at all.
    ///
    /// `Log` is fire-and-forget; every other command gets a `commandResponse`.
    pub fn expects_response(self) -> bool {
        !matches!(self, Self::Log)
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ValidationError::Unknown {
                path: "$.data.commandName".to_string(),
                value: s.to_string(),
            })
    }
}

/// Payload of [`TaskCommand::StartNewTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartNewTask {
    /// Engine settings applied to the new task.
    pub configuration: Map<String, Value>,
    /// The initial prompt.
    pub text: String,
    /// Base64 data URLs attached to the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    /// Open the task in a new editor tab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tab: Option<bool>,
}

impl StartNewTask {
    /// A task with empty configuration and no images.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            configuration: Map::new(),
            text: text.into(),
            images: None,
            new_tab: None,
        }
    }
}

/// Payload of [`TaskCommand::SendMessage`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Text to send to the current task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Base64 data URLs to attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// A command with its payload.
///
/// Each variant fixes the type of its `data`. Unit variants carry no data
/// (absent or `null` on the wire).
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs, reason = "one variant per CommandName, payloads documented in the table")]
pub enum TaskCommand {
    StartNewTask(StartNewTask),
    CancelTask(String),
    CloseTask(String),
    GetCurrentTaskStack,
    ClearCurrentTask(Option<String>),
    CancelCurrentTask,
    SendMessage(SendMessage),
    PressPrimaryButton,
    PressSecondaryButton,
    SetConfiguration(Value),
    GetConfiguration,
    IsReady,
    GetMessages(String),
    GetTokenUsage(String),
    Log(String),
    ResumeTask(String),
    IsTaskInHistory(String),
    CreateProfile(String),
    GetProfiles,
    SetActiveProfile(String),
    GetActiveProfile,
    DeleteProfile(String),
}

impl TaskCommand {
    /// The discriminator for this command.
    pub fn name(&self) -> CommandName {
        match self {
            Self::StartNewTask(_) => CommandName::StartNewTask,
            Self::CancelTask(_) => CommandName::CancelTask,
            Self::CloseTask(_) => CommandName::CloseTask,
            Self::GetCurrentTaskStack => CommandName::GetCurrentTaskStack,
            Self::ClearCurrentTask(_) => CommandName::ClearCurrentTask,
            Self::CancelCurrentTask => CommandName::CancelCurrentTask,
            Self::SendMessage(_) => CommandName::SendMessage,
            Self::PressPrimaryButton => CommandName::PressPrimaryButton,
            Self::PressSecondaryButton => CommandName::PressSecondaryButton,
            Self::SetConfiguration(_) => CommandName::SetConfiguration,
            Self::GetConfiguration => CommandName::GetConfiguration,
            Self::IsReady => CommandName::IsReady,
            Self::GetMessages(_) => CommandName::GetMessages,
            Self::GetTokenUsage(_) => CommandName::GetTokenUsage,
            Self::Log(_) => CommandName::Log,
            Self::ResumeTask(_) => CommandName::ResumeTask,
            Self::IsTaskInHistory(_) => CommandName::IsTaskInHistory,
            Self::CreateProfile(_) => CommandName::CreateProfile,
            Self::GetProfiles => CommandName::GetProfiles,
            Self::SetActiveProfile(_) => CommandName::SetActiveProfile,
            Self::GetActiveProfile => CommandName::GetActiveProfile,
            Self::DeleteProfile(_) => CommandName::DeleteProfile,
        }
    }

    /// The `data` field, or `None` when the command carries nothing.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::StartNewTask(payload) => serde_json::to_value(payload).ok(),
            Self::SendMessage(payload) => serde_json::to_value(payload).ok(),
            Self::CancelTask(s)
            | Self::CloseTask(s)
            | Self::GetMessages(s)
            | Self::GetTokenUsage(s)
            | Self::Log(s)
            | Self::ResumeTask(s)
            | Self::IsTaskInHistory(s)
            | Self::CreateProfile(s)
            | Self::SetActiveProfile(s)
            | Self::DeleteProfile(s) => Some(json!(s)),
            Self::ClearCurrentTask(s) => s.as_ref().map(|s| json!(s)),
            Self::SetConfiguration(value) => (!value.is_null()).then(|| value.clone()),
            Self::GetCurrentTaskStack
            | Self::CancelCurrentTask
            | Self::PressPrimaryButton
            | Self::PressSecondaryButton
            | Self::GetConfiguration
            | Self::IsReady
            | Self::GetProfiles
            | Self::GetActiveProfile => None,
        }
    }

    /// Rebuilds a command from its discriminator and `data`.
    ///
    /// `data` of `null` is treated as absent.
    pub fn from_parts(name: CommandName, data: Option<&Value>) -> Result<Self, ValidationError> {
        const PATH: &str = "$.data.data";
        let data = data.filter(|v| !v.is_null());

        let string = |data: Option<&Value>| -> Result<String, ValidationError> {
            match data {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(ValidationError::WrongType {
                    path: PATH.to_string(),
                    expected: "string",
                }),
                None => Err(ValidationError::Missing {
                    path: PATH.to_string(),
                }),
            }
        };
        let nothing = |data: Option<&Value>, command: Self| -> Result<Self, ValidationError> {
            match data {
                None => Ok(command),
                Some(_) => Err(ValidationError::Payload {
                    path: PATH.to_string(),
                    reason: format!("{name} takes no data"),
                }),
            }
        };

        Ok(match name {
            CommandName::StartNewTask => {
                let data = data.ok_or_else(|| ValidationError::Missing {
                    path: PATH.to_string(),
                })?;
                Self::StartNewTask(decode(data, PATH)?)
            }
            CommandName::CancelTask => Self::CancelTask(string(data)?),
            CommandName::CloseTask => Self::CloseTask(string(data)?),
            CommandName::GetCurrentTaskStack => nothing(data, Self::GetCurrentTaskStack)?,
            CommandName::ClearCurrentTask => {
                Self::ClearCurrentTask(data.map(|d| string(Some(d))).transpose()?)
            }
            CommandName::CancelCurrentTask => nothing(data, Self::CancelCurrentTask)?,
            CommandName::SendMessage => match data {
                Some(d) => Self::SendMessage(decode(d, PATH)?),
                None => Self::SendMessage(SendMessage::default()),
            },
            CommandName::PressPrimaryButton => nothing(data, Self::PressPrimaryButton)?,
            CommandName::PressSecondaryButton => nothing(data, Self::PressSecondaryButton)?,
            CommandName::SetConfiguration => {
                Self::SetConfiguration(data.cloned().unwrap_or(Value::Null))
            }
            CommandName::GetConfiguration => nothing(data, Self::GetConfiguration)?,
            CommandName::IsReady => nothing(data, Self::IsReady)?,
            CommandName::GetMessages => Self::GetMessages(string(data)?),
            CommandName::GetTokenUsage => Self::GetTokenUsage(string(data)?),
            CommandName::Log => Self::Log(string(data)?),
            CommandName::ResumeTask => Self::ResumeTask(string(data)?),
            CommandName::IsTaskInHistory => Self::IsTaskInHistory(string(data)?),
            CommandName::CreateProfile => Self::CreateProfile(string(data)?),
            CommandName::GetProfiles => nothing(data, Self::GetProfiles)?,
            CommandName::SetActiveProfile => Self::SetActiveProfile(string(data)?),
            CommandName::GetActiveProfile => nothing(data, Self::GetActiveProfile)?,
            CommandName::DeleteProfile => Self::DeleteProfile(string(data)?),
        })
    }
}

/// The `data` of a TaskCommand envelope: a command plus its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Per-call correlation id. Older clients may omit it.
    pub request_id: Option<String>,
    /// The command.
    pub command: TaskCommand,
}

impl CommandRequest {
    /// A request with a correlation id.
    pub fn new(request_id: impl Into<String>, command: TaskCommand) -> Self {
        Self {
            request_id: Some(request_id.into()),
            command,
        }
    }

    /// Wire representation: `{commandName, requestId?, data?}`.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("commandName".into(), json!(self.command.name().as_str()));
        if let Some(id) = &self.request_id {
            obj.insert("requestId".into(), json!(id));
        }
        if let Some(data) = self.command.data() {
            obj.insert("data".into(), data);
        }
        Value::Object(obj)
    }

    pub(super) fn from_value(value: &Value, path: &str) -> Result<Self, ValidationError> {
        let obj = as_object(value, path)?;
        let name: CommandName = required_str(obj, "commandName", path)?.parse()?;
        let request_id = optional_str(obj, "requestId", path)?.map(str::to_string);
        let command = TaskCommand::from_parts(name, obj.get("data"))?;
        Ok(Self {
            request_id,
            command,
        })
    }
}
