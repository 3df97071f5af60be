//! In-memory task engine.
//!
//! Stands in for a real assistant: tasks are records with a transcript, a
//! stack of active tasks and a history of finished ones. Every state change
//! is announced on the event channel returned by [`InMemoryEngine::new`],
//! which the server forwards to clients. It is what `taskwire serve` runs
//! and what the integration tests drive.
//!
//! Conversation model per task:
//!
//! ```text
//! start ─► ask:followup ─► (send_message) ─► ask:completion_result ─► (primary) ─► completed
//!                     └──────────────── (secondary / cancel) ───────────────────► aborted
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{ApiError, ApiResult, TaskApi};
use crate::protocol::{
    ClineMessage, MessageAction, MessageEvent, MessageKind, SendMessage, StartNewTask, TaskEvent,
    TokenUsage, ToolUsage, ToolUsageEntry,
};

const DEFAULT_PROFILE: &str = "default";

#[derive(Debug)]
struct TaskRecord {
    messages: Vec<ClineMessage>,
    usage: TokenUsage,
    tools: ToolUsage,
    /// Ask subtype the task is waiting on, if any.
    pending_ask: Option<String>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            usage: TokenUsage::default(),
            tools: ToolUsage::new(),
            pending_ask: None,
        }
    }
}

#[derive(Debug)]
struct EngineState {
    tasks: HashMap<String, TaskRecord>,
    stack: Vec<String>,
    history: Vec<String>,
    configuration: Map<String, Value>,
    profiles: BTreeMap<String, String>,
    active_profile: Option<String>,
    last_ts: i64,
}

impl EngineState {
    /// Strictly increasing message timestamps (they double as message ids).
    fn next_ts(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_ts = now.max(self.last_ts + 1);
        self.last_ts
    }

    fn current(&self) -> ApiResult<String> {
        self.stack
            .last()
            .cloned()
            .ok_or_else(|| ApiError::InvalidState("no active task".to_string()))
    }
}

/// A self-contained [`TaskApi`] implementation.
#[derive(Debug)]
pub struct InMemoryEngine {
    state: Mutex<EngineState>,
    events: UnboundedSender<TaskEvent>,
}

impl InMemoryEngine {
    /// Creates the engine and the receiving end of its event stream.
    pub fn new() -> (Self, UnboundedReceiver<TaskEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), uuid::Uuid::new_v4().to_string());
        let engine = Self {
            state: Mutex::new(EngineState {
                tasks: HashMap::new(),
                stack: Vec::new(),
                history: Vec::new(),
                configuration: Map::new(),
                profiles,
                active_profile: Some(DEFAULT_PROFILE.to_string()),
                last_ts: 0,
            }),
            events,
        };
        (engine, rx)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            log::trace!("[Engine] No event listener");
        }
    }

    /// Appends a message to `task_id` and announces it.
    fn push_message(
        &self,
        state: &mut EngineState,
        task_id: &str,
        kind: MessageKind,
        subtype: &str,
        text: String,
        images: Option<Vec<String>>,
    ) {
        let ts = state.next_ts();
        let message = ClineMessage {
            ts,
            kind,
            ask: (kind == MessageKind::Ask).then(|| subtype.to_string()),
            say: (kind == MessageKind::Say).then(|| subtype.to_string()),
            text: Some(text),
            images,
            partial: None,
            reasoning: None,
            extra: Map::new(),
        };
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        if kind == MessageKind::Ask {
            task.pending_ask = Some(subtype.to_string());
        }
        task.messages.push(message.clone());
        self.emit(TaskEvent::Message(MessageEvent {
            task_id: task_id.to_string(),
            action: MessageAction::Created,
            message,
        }));
    }

    /// Counts a simulated API round trip of `text` against the task.
    fn account(&self, state: &mut EngineState, task_id: &str, text: &str, tool: &str) {
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        let tokens_in = u64::try_from(text.split_whitespace().count()).unwrap_or(u64::MAX) + 8;
        task.usage.total_tokens_in += tokens_in;
        task.usage.total_tokens_out += 16;
        task.usage.context_tokens = task.usage.total_tokens_in + task.usage.total_tokens_out;
        task.usage.total_cost = task.usage.context_tokens as f64 * 0.000_002;
        task.tools.entry(tool.to_string()).or_insert_with(ToolUsageEntry::default).attempts += 1;
        self.emit(TaskEvent::TaskTokenUsageUpdated(
            task_id.to_string(),
            task.usage.clone(),
        ));
    }

    /// Pops `task_id` off the stack into history.
    fn retire(state: &mut EngineState, task_id: &str) {
        state.stack.retain(|id| id != task_id);
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.pending_ask = None;
        }
        if !state.history.iter().any(|id| id == task_id) {
            state.history.push(task_id.to_string());
        }
    }

    fn abort(&self, state: &mut EngineState, task_id: &str) {
        Self::retire(state, task_id);
        log::info!("[Engine] Task {task_id} aborted");
        self.emit(TaskEvent::TaskAborted(task_id.to_string()));
    }
}

#[async_trait]
impl TaskApi for InMemoryEngine {
    async fn start_new_task(&self, client_id: &str, task: StartNewTask) -> ApiResult<String> {
        if task.text.trim().is_empty() && task.images.as_ref().is_none_or(Vec::is_empty) {
            return Err(ApiError::InvalidArgument("task text is empty".to_string()));
        }
        let task_id = uuid::Uuid::new_v4().to_string();
        let mut state = self.lock();
        state.configuration.extend(task.configuration);

        if let Some(parent) = state.stack.last().cloned() {
            if task.new_tab != Some(true) {
                self.emit(TaskEvent::TaskPaused(parent.clone()));
                self.emit(TaskEvent::TaskSpawned(parent, task_id.clone()));
            }
        }
        state.tasks.insert(task_id.clone(), TaskRecord::new());
        state.stack.push(task_id.clone());
        log::info!("[Engine] Client {client_id} started task {task_id}");
        self.emit(TaskEvent::TaskCreated(task_id.clone()));
        self.emit(TaskEvent::TaskStarted(task_id.clone()));

        self.push_message(&mut state, &task_id, MessageKind::Say, "text", task.text.clone(), task.images);
        self.account(&mut state, &task_id, &task.text, "ask_followup_question");
        self.push_message(
            &mut state,
            &task_id,
            MessageKind::Ask,
            "followup",
            format!("Received {} words. Anything to add?", task.text.split_whitespace().count()),
            None,
        );
        Ok(task_id)
    }

    async fn cancel_task(&self, _client_id: &str, task_id: String) -> ApiResult<()> {
        let mut state = self.lock();
        if !state.stack.contains(&task_id) {
            return Err(ApiError::NotFound(format!("task {task_id}")));
        }
        self.abort(&mut state, &task_id);
        Ok(())
    }

    async fn close_task(&self, _client_id: &str, task_id: String) -> ApiResult<()> {
        let mut state = self.lock();
        if state.stack.last() != Some(&task_id) {
            return Err(ApiError::InvalidState(format!(
                "Task {task_id} is not the current active task. Cannot close."
            )));
        }
        Self::retire(&mut state, &task_id);
        Ok(())
    }

    async fn get_current_task_stack(&self, _client_id: &str) -> ApiResult<Vec<String>> {
        Ok(self.lock().stack.clone())
    }

    async fn clear_current_task(
        &self,
        _client_id: &str,
        last_message: Option<String>,
    ) -> ApiResult<()> {
        let mut state = self.lock();
        let Ok(task_id) = state.current() else {
            return Ok(());
        };
        if let Some(text) = last_message {
            self.push_message(&mut state, &task_id, MessageKind::Say, "text", text, None);
        }
        Self::retire(&mut state, &task_id);
        Ok(())
    }

    async fn cancel_current_task(&self, _client_id: &str) -> ApiResult<()> {
        let mut state = self.lock();
        if let Ok(task_id) = state.current() {
            self.abort(&mut state, &task_id);
        }
        Ok(())
    }

    async fn send_message(&self, _client_id: &str, message: SendMessage) -> ApiResult<()> {
        let mut state = self.lock();
        let task_id = state.current()?;
        let text = message.message.unwrap_or_default();
        if text.is_empty() && message.images.as_ref().is_none_or(Vec::is_empty) {
            return Err(ApiError::InvalidArgument("message is empty".to_string()));
        }

        let was_waiting = state
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.pending_ask.is_some());
        self.push_message(&mut state, &task_id, MessageKind::Say, "user_feedback", text.clone(), message.images);
        if was_waiting {
            self.emit(TaskEvent::TaskAskResponded(task_id.clone()));
        }
        self.account(&mut state, &task_id, &text, "attempt_completion");
        self.push_message(
            &mut state,
            &task_id,
            MessageKind::Ask,
            "completion_result",
            format!("Done: {text}"),
            None,
        );
        Ok(())
    }

    async fn press_primary_button(&self, _client_id: &str) -> ApiResult<()> {
        let mut state = self.lock();
        let task_id = state.current()?;
        let pending = state
            .tasks
            .get_mut(&task_id)
            .and_then(|t| t.pending_ask.take())
            .ok_or_else(|| ApiError::InvalidState(format!("task {task_id} is not waiting for input")))?;
        self.emit(TaskEvent::TaskAskResponded(task_id.clone()));

        if pending == "completion_result" {
            Self::retire(&mut state, &task_id);
            let (usage, tools) = state
                .tasks
                .get(&task_id)
                .map(|t| (t.usage.clone(), t.tools.clone()))
                .unwrap_or_default();
            log::info!("[Engine] Task {task_id} completed");
            self.emit(TaskEvent::TaskCompleted(task_id.clone(), usage, tools));

            // Resume the parent, if this was a subtask.
            if let Some(parent) = state.stack.last().cloned() {
                self.emit(TaskEvent::TaskUnpaused(parent));
            }
        }
        Ok(())
    }

    async fn press_secondary_button(&self, _client_id: &str) -> ApiResult<()> {
        let mut state = self.lock();
        let task_id = state.current()?;
        let waiting = state
            .tasks
            .get_mut(&task_id)
            .and_then(|t| t.pending_ask.take())
            .is_some();
        if !waiting {
            return Err(ApiError::InvalidState(format!(
                "task {task_id} is not waiting for input"
            )));
        }
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.tools
                .entry("attempt_completion".to_string())
                .or_default()
                .failures += 1;
        }
        self.emit(TaskEvent::TaskAskResponded(task_id.clone()));
        self.emit(TaskEvent::TaskToolFailed(
            task_id.clone(),
            "attempt_completion".to_string(),
            "rejected by user".to_string(),
        ));
        self.abort(&mut state, &task_id);
        Ok(())
    }

    async fn set_configuration(&self, _client_id: &str, values: Value) -> ApiResult<()> {
        let Value::Object(values) = values else {
            return Err(ApiError::InvalidArgument(
                "configuration must be an object".to_string(),
            ));
        };
        let mut state = self.lock();
        if let Some(Value::String(mode)) = values.get("mode") {
            if let Some(task_id) = state.stack.last() {
                self.emit(TaskEvent::TaskModeSwitched(task_id.clone(), mode.clone()));
            }
        }
        state.configuration.extend(values);
        Ok(())
    }

    async fn get_configuration(&self, _client_id: &str) -> ApiResult<Value> {
        let state = self.lock();
        let mut config = state.configuration.clone();
        config.insert("currentApiConfigName".into(), json!(state.active_profile));
        Ok(Value::Object(config))
    }

    async fn is_ready(&self, _client_id: &str) -> ApiResult<bool> {
        Ok(true)
    }

    async fn get_messages(&self, _client_id: &str, task_id: String) -> ApiResult<Vec<ClineMessage>> {
        Ok(self
            .lock()
            .tasks
            .get(&task_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default())
    }

    async fn get_token_usage(
        &self,
        _client_id: &str,
        task_id: String,
    ) -> ApiResult<Option<TokenUsage>> {
        Ok(self.lock().tasks.get(&task_id).map(|t| t.usage.clone()))
    }

    async fn log(&self, client_id: &str, message: String) {
        log::info!("[Engine] [{client_id}] {message}");
    }

    async fn resume_task(&self, _client_id: &str, task_id: String) -> ApiResult<()> {
        let mut state = self.lock();
        if !state.history.contains(&task_id) {
            return Err(ApiError::NotFound(format!("task {task_id} in history")));
        }
        state.history.retain(|id| id != &task_id);
        state.stack.push(task_id.clone());
        self.emit(TaskEvent::TaskStarted(task_id.clone()));
        self.push_message(
            &mut state,
            &task_id,
            MessageKind::Ask,
            "resume_task",
            "Resumed. Continue?".to_string(),
            None,
        );
        Ok(())
    }

    async fn is_task_in_history(&self, _client_id: &str, task_id: String) -> ApiResult<bool> {
        Ok(self.lock().history.contains(&task_id))
    }

    async fn create_profile(&self, _client_id: &str, name: String) -> ApiResult<String> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ApiError::InvalidArgument("profile name is empty".to_string()));
        }
        let mut state = self.lock();
        if state.profiles.contains_key(&name) {
            return Err(ApiError::InvalidState(format!("profile {name} already exists")));
        }
        let id = uuid::Uuid::new_v4().to_string();
        state.profiles.insert(name, id.clone());
        Ok(id)
    }

    async fn get_profiles(&self, _client_id: &str) -> ApiResult<Vec<String>> {
        Ok(self.lock().profiles.keys().cloned().collect())
    }

    async fn set_active_profile(&self, _client_id: &str, name: String) -> ApiResult<()> {
        let mut state = self.lock();
        if !state.profiles.contains_key(&name) {
            return Err(ApiError::NotFound(format!("profile {name}")));
        }
        state.active_profile = Some(name);
        Ok(())
    }

    async fn get_active_profile(&self, _client_id: &str) -> ApiResult<Option<String>> {
        Ok(self.lock().active_profile.clone())
    }

    async fn delete_profile(&self, _client_id: &str, name: String) -> ApiResult<()> {
        let mut state = self.lock();
        if state.profiles.remove(&name).is_none() {
            return Err(ApiError::NotFound(format!("profile {name}")));
        }
        if state.active_profile.as_deref() == Some(name.as_str()) {
            state.active_profile = state.profiles.keys().next().cloned();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_task_lifecycle_to_completion() {
        let (engine, mut rx) = InMemoryEngine::new();
        let id = engine
            .start_new_task("c", StartNewTask::new("write a test"))
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0], TaskEvent::TaskCreated(id.clone()));
        assert_eq!(events[1], TaskEvent::TaskStarted(id.clone()));
        assert_eq!(engine.get_current_task_stack("c").await.unwrap(), vec![id.clone()]);

        engine
            .send_message(
                "c",
                SendMessage {
                    message: Some("ship it".into()),
                    images: None,
                },
            )
            .await
            .unwrap();
        engine.press_primary_button("c").await.unwrap();

        let events = drain(&mut rx);
        assert!(events.contains(&TaskEvent::TaskAskResponded(id.clone())));
        assert!(matches!(events.last(), Some(TaskEvent::TaskCompleted(done, _, tools))
            if done == &id && tools["attempt_completion"].attempts == 1));
        assert!(engine.get_current_task_stack("c").await.unwrap().is_empty());
        assert!(engine.is_task_in_history("c", id.clone()).await.unwrap());

        let messages = engine.get_messages("c", id.clone()).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert!(messages.windows(2).all(|w| w[0].ts < w[1].ts));
        assert!(engine.get_token_usage("c", id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_subtask_pauses_parent() {
        let (engine, mut rx) = InMemoryEngine::new();
        let parent = engine.start_new_task("c", StartNewTask::new("parent")).await.unwrap();
        drain(&mut rx);
        let child = engine.start_new_task("c", StartNewTask::new("child")).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0], TaskEvent::TaskPaused(parent.clone()));
        assert_eq!(events[1], TaskEvent::TaskSpawned(parent.clone(), child.clone()));

        engine.cancel_task("c", child.clone()).await.unwrap();
        assert_eq!(engine.get_current_task_stack("c").await.unwrap(), vec![parent]);
        assert!(drain(&mut rx).contains(&TaskEvent::TaskAborted(child)));
    }

    #[tokio::test]
    async fn test_close_only_current_task() {
        let (engine, _rx) = InMemoryEngine::new();
        let first = engine.start_new_task("c", StartNewTask::new("one")).await.unwrap();
        let _second = engine.start_new_task("c", StartNewTask::new("two")).await.unwrap();
        let err = engine.close_task("c", first).await.unwrap_err();
        assert!(err.to_string().contains("not the current active task"));
    }

    #[tokio::test]
    async fn test_secondary_button_rejects_and_aborts() {
        let (engine, mut rx) = InMemoryEngine::new();
        let id = engine.start_new_task("c", StartNewTask::new("try")).await.unwrap();
        drain(&mut rx);
        engine.press_secondary_button("c").await.unwrap();
        let events = drain(&mut rx);
        assert!(events.contains(&TaskEvent::TaskToolFailed(
            id.clone(),
            "attempt_completion".into(),
            "rejected by user".into()
        )));
        assert_eq!(events.last(), Some(&TaskEvent::TaskAborted(id.clone())));

        engine.resume_task("c", id.clone()).await.unwrap();
        assert_eq!(engine.get_current_task_stack("c").await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_commands_without_task_fail() {
        let (engine, _rx) = InMemoryEngine::new();
        assert!(engine.press_primary_button("c").await.is_err());
        assert!(engine.send_message("c", SendMessage::default()).await.is_err());
        assert!(engine.cancel_current_task("c").await.is_ok());
        assert!(engine.clear_current_task("c", None).await.is_ok());
        assert!(engine
            .start_new_task("c", StartNewTask::new("  "))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_profiles() {
        let (engine, _rx) = InMemoryEngine::new();
        assert_eq!(engine.get_profiles("c").await.unwrap(), vec!["default"]);
        engine.create_profile("c", "work".into()).await.unwrap();
        assert!(engine.create_profile("c", "work".into()).await.is_err());
        engine.set_active_profile("c", "work".into()).await.unwrap();
        assert_eq!(engine.get_active_profile("c").await.unwrap().as_deref(), Some("work"));

        engine.delete_profile("c", "work".into()).await.unwrap();
        assert_eq!(engine.get_active_profile("c").await.unwrap().as_deref(), Some("default"));
        assert_eq!(
            engine.set_active_profile("c", "work".into()).await,
            Err(ApiError::NotFound("profile work".into()))
        );
    }

    #[tokio::test]
    async fn test_configuration_merge_and_mode_switch() {
        let (engine, mut rx) = InMemoryEngine::new();
        let id = engine.start_new_task("c", StartNewTask::new("cfg")).await.unwrap();
        drain(&mut rx);
        engine
            .set_configuration("c", json!({"mode": "architect", "autoApprove": true}))
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![TaskEvent::TaskModeSwitched(id, "architect".into())]
        );
        let config = engine.get_configuration("c").await.unwrap();
        assert_eq!(config["autoApprove"], true);
        assert_eq!(config["currentApiConfigName"], "default");
        assert!(engine.set_configuration("c", json!(3)).await.is_err());
    }
}
