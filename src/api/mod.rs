//! The handler table the server dispatches commands into.
//!
//! [`TaskApi`] has one method per [`TaskCommand`] variant and no default
//! bodies, so an engine that compiles handles every command. [`dispatch`]
//! matches the command exhaustively and turns the typed result into the
//! `commandResponse` payload.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::protocol::{ClineMessage, SendMessage, StartNewTask, TaskCommand, TokenUsage};

/// Failures an engine reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The named task or profile does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The command's arguments are unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The command does not apply in the current state.
    #[error("{0}")]
    InvalidState(String),
    /// The engine failed internally.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for engine methods.
pub type ApiResult<T> = Result<T, ApiError>;

/// The task engine as seen from the control plane.
///
/// `client_id` identifies the connection that issued the command.
#[async_trait]
#[allow(missing_docs, reason = "each method is the command of the same name")]
pub trait TaskApi: Send + Sync + 'static {
    async fn start_new_task(&self, client_id: &str, task: StartNewTask) -> ApiResult<String>;
    async fn cancel_task(&self, client_id: &str, task_id: String) -> ApiResult<()>;
    async fn close_task(&self, client_id: &str, task_id: String) -> ApiResult<()>;
    async fn get_current_task_stack(&self, client_id: &str) -> ApiResult<Vec<String>>;
    async fn clear_current_task(&self, client_id: &str, last_message: Option<String>)
        -> ApiResult<()>;
    async fn cancel_current_task(&self, client_id: &str) -> ApiResult<()>;
    async fn send_message(&self, client_id: &str, message: SendMessage) -> ApiResult<()>;
    async fn press_primary_button(&self, client_id: &str) -> ApiResult<()>;
    async fn press_secondary_button(&self, client_id: &str) -> ApiResult<()>;
    async fn set_configuration(&self, client_id: &str, values: Value) -> ApiResult<()>;
    async fn get_configuration(&self, client_id: &str) -> ApiResult<Value>;
    async fn is_ready(&self, client_id: &str) -> ApiResult<bool>;
    async fn get_messages(&self, client_id: &str, task_id: String) -> ApiResult<Vec<ClineMessage>>;
    async fn get_token_usage(&self, client_id: &str, task_id: String)
        -> ApiResult<Option<TokenUsage>>;
    /// Fire-and-forget: produces no reply.
    async fn log(&self, client_id: &str, message: String);
    async fn resume_task(&self, client_id: &str, task_id: String) -> ApiResult<()>;
    async fn is_task_in_history(&self, client_id: &str, task_id: String) -> ApiResult<bool>;
    async fn create_profile(&self, client_id: &str, name: String) -> ApiResult<String>;
    async fn get_profiles(&self, client_id: &str) -> ApiResult<Vec<String>>;
    async fn set_active_profile(&self, client_id: &str, name: String) -> ApiResult<()>;
    async fn get_active_profile(&self, client_id: &str) -> ApiResult<Option<String>>;
    async fn delete_profile(&self, client_id: &str, name: String) -> ApiResult<()>;
}

/// Runs one command against `api`.
///
/// Returns `None` for commands that never produce a reply (`Log`).
/// Unit results become `{"success": true}`.
pub async fn dispatch(
    api: &dyn TaskApi,
    client_id: &str,
    command: TaskCommand,
) -> Option<ApiResult<Value>> {
    let reply = match command {
        TaskCommand::StartNewTask(task) => to_json(api.start_new_task(client_id, task).await),
        TaskCommand::CancelTask(id) => acknowledged(api.cancel_task(client_id, id).await),
        TaskCommand::CloseTask(id) => acknowledged(api.close_task(client_id, id).await),
        TaskCommand::GetCurrentTaskStack => to_json(api.get_current_task_stack(client_id).await),
        TaskCommand::ClearCurrentTask(last) => {
            acknowledged(api.clear_current_task(client_id, last).await)
        }
        TaskCommand::CancelCurrentTask => acknowledged(api.cancel_current_task(client_id).await),
        TaskCommand::SendMessage(message) => {
            acknowledged(api.send_message(client_id, message).await)
        }
        TaskCommand::PressPrimaryButton => acknowledged(api.press_primary_button(client_id).await),
        TaskCommand::PressSecondaryButton => {
            acknowledged(api.press_secondary_button(client_id).await)
        }
        TaskCommand::SetConfiguration(values) => {
            acknowledged(api.set_configuration(client_id, values).await)
        }
        TaskCommand::GetConfiguration => api.get_configuration(client_id).await,
        TaskCommand::IsReady => to_json(api.is_ready(client_id).await),
        TaskCommand::GetMessages(id) => to_json(api.get_messages(client_id, id).await),
        TaskCommand::GetTokenUsage(id) => to_json(api.get_token_usage(client_id, id).await),
        TaskCommand::Log(message) => {
            api.log(client_id, message).await;
            return None;
        }
        TaskCommand::ResumeTask(id) => acknowledged(api.resume_task(client_id, id).await),
        TaskCommand::IsTaskInHistory(id) => to_json(api.is_task_in_history(client_id, id).await),
        TaskCommand::CreateProfile(name) => to_json(api.create_profile(client_id, name).await),
        TaskCommand::GetProfiles => to_json(api.get_profiles(client_id).await),
        TaskCommand::SetActiveProfile(name) => {
            acknowledged(api.set_active_profile(client_id, name).await)
        }
        TaskCommand::GetActiveProfile => to_json(api.get_active_profile(client_id).await),
        TaskCommand::DeleteProfile(name) => acknowledged(api.delete_profile(client_id, name).await),
    };
    Some(reply)
}

fn to_json<T: Serialize>(result: ApiResult<T>) -> ApiResult<Value> {
    result.and_then(|value| {
        serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
    })
}

fn acknowledged(result: ApiResult<()>) -> ApiResult<Value> {
    result.map(|()| json!({ "success": true }))
}
