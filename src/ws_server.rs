//! WebSocket binding for browser and script clients.
//!
//! Speaks a request/response dialect instead of envelopes:
//!
//! ```text
//! -> {"type":"command","commandName":"getMessages","requestId":"7","taskId":"..."}
//! <- {"type":"response","status":"success","requestId":"7","commandName":"getMessages",
//!     "data":{"messages":[...]}}
//! <- {"type":"event","eventName":"taskStarted","taskId":"...","payload":["..."]}
//! ```
//!
//! Commands go through the same [`TaskApi`] and [`api::dispatch`] as the
//! control channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiError, TaskApi};
use crate::config::ConfigError;
use crate::constants::{MIN_WS_PORT, WS_WELCOME_REQUEST_ID};
use crate::protocol::{CommandName, TaskCommand, TaskEvent};
use crate::ws::{self, WsMessage};

/// Error codes carried in `error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsErrorCode {
    /// A required field is missing or has the wrong type.
    InvalidParameter,
    /// Unknown message type or command name.
    InvalidCommand,
    /// The message was not JSON.
    InvalidJson,
    /// The engine rejected the command.
    ExecutionError,
    /// Anything else.
    ServerError,
}

impl WsErrorCode {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::InvalidCommand => "INVALID_COMMAND",
            Self::InvalidJson => "INVALID_JSON",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::ServerError => "SERVER_ERROR",
        }
    }
}

#[derive(Debug)]
struct Rejection {
    code: WsErrorCode,
    message: String,
}

impl Rejection {
    fn new(code: WsErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

type Clients = Arc<Mutex<HashMap<u64, UnboundedSender<String>>>>;

fn lock(clients: &Clients) -> MutexGuard<'_, HashMap<u64, UnboundedSender<String>>> {
    clients.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Checks a WebSocket port. `0` asks the OS for an ephemeral port.
pub fn validate_port(port: u16) -> Result<(), ConfigError> {
    if port != 0 && port < MIN_WS_PORT {
        return Err(ConfigError::InvalidWsPort(port));
    }
    Ok(())
}

/// A running WebSocket binding.
pub struct WsServer {
    local_addr: SocketAddr,
    clients: Clients,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("local_addr", &self.local_addr)
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl WsServer {
    /// Binds `host:port` and starts accepting.
    pub async fn start(host: &str, port: u16, api: Arc<dyn TaskApi>) -> Result<Self> {
        validate_port(port)?;
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("Failed to bind ws://{host}:{port}"))?;
        let local_addr = listener.local_addr()?;
        log::info!("[WsServer] Listening on ws://{local_addr}");

        let clients: Clients = Arc::default();
        let cancel = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            api,
            Arc::clone(&clients),
            cancel.clone(),
        ));
        Ok(Self {
            local_addr,
            clients,
            cancel,
            tasks: vec![accept],
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connected WebSocket clients.
    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Sends `event` to every client. Command responses are not forwarded.
    pub fn broadcast(&self, event: &TaskEvent) -> usize {
        let Some(text) = event_message(event) else {
            return 0;
        };
        let mut clients = lock(&self.clients);
        clients.retain(|_, tx| tx.send(text.clone()).is_ok());
        clients.len()
    }

    /// Broadcasts every event received on `events`.
    pub fn forward_events(&mut self, mut events: UnboundedReceiver<TaskEvent>) {
        let clients = Arc::clone(&self.clients);
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                if let Some(text) = event_message(&event) {
                    lock(&clients).retain(|_, tx| tx.send(text.clone()).is_ok());
                }
            }
        }));
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        lock(&self.clients).clear();
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    api: Arc<dyn TaskApi>,
    clients: Clients,
    cancel: CancellationToken,
) {
    let mut next_id = 0u64;
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                next_id += 1;
                let id = next_id;
                log::info!("[WsServer] New connection from {peer}");
                tokio::spawn(handle_connection(
                    id,
                    stream,
                    Arc::clone(&api),
                    Arc::clone(&clients),
                    cancel.clone(),
                ));
            }
            Err(e) => {
                log::error!("[WsServer] Accept error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    id: u64,
    stream: TcpStream,
    api: Arc<dyn TaskApi>,
    clients: Clients,
    cancel: CancellationToken,
) {
    let (mut writer, mut reader) = match ws::accept(stream).await {
        Ok(halves) => halves,
        Err(e) => {
            log::warn!("[WsServer] {e:#}");
            return;
        }
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    lock(&clients).insert(id, tx.clone());
    let client_id = format!("ws-{id}");

    let _ = tx.send(
        json!({
            "type": "response",
            "status": "success",
            "requestId": WS_WELCOME_REQUEST_ID,
            "commandName": "welcome",
            "data": {
                "message": "Connected to taskwire",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
        .to_string(),
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            outgoing = rx.recv() => {
                let Some(text) = outgoing else { break };
                if let Err(e) = writer.send_text(&text).await {
                    log::warn!("[WsServer] {client_id}: {e:#}");
                    break;
                }
            }
            incoming = reader.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let api = Arc::clone(&api);
                    let tx = tx.clone();
                    let client_id = client_id.clone();
                    tokio::spawn(async move {
                        let reply = handle_message(api.as_ref(), &client_id, &text).await;
                        let _ = tx.send(reply.to_string());
                    });
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if writer.send_pong(data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(_) | WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { .. })) | None => break,
                Some(Err(e)) => {
                    log::warn!("[WsServer] {client_id}: {e:#}");
                    break;
                }
            },
        }
    }

    lock(&clients).remove(&id);
    let _ = writer.close().await;
    log::info!("[WsServer] Client disconnected: {client_id}");
}

/// Handles one text message and returns the response object.
async fn handle_message(api: &dyn TaskApi, client_id: &str, text: &str) -> Value {
    let request: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            return error_response(
                None,
                None,
                &Rejection::new(WsErrorCode::InvalidJson, format!("Invalid JSON: {e}")),
            )
        }
    };
    let request_id = request.get("requestId").and_then(Value::as_str);
    let command_field = request.get("commandName").and_then(Value::as_str);

    if request.get("type").and_then(Value::as_str) != Some("command") {
        let rejection = Rejection::new(WsErrorCode::InvalidCommand, "Message type must be 'command'");
        return error_response(request_id, command_field, &rejection);
    }
    let Some(request_id) = request_id else {
        let rejection = Rejection::new(WsErrorCode::InvalidParameter, "Missing 'requestId' in command");
        return error_response(None, command_field, &rejection);
    };
    let Some(name) = command_field.and_then(CommandName::from_ws_name) else {
        let rejection = Rejection::new(
            WsErrorCode::InvalidCommand,
            format!("Unknown command: {}", command_field.unwrap_or("")),
        );
        return error_response(Some(request_id), command_field, &rejection);
    };

    let task_id = request.get("taskId").and_then(Value::as_str);
    let args = request.get("arguments").and_then(Value::as_object);
    let command = match build_command(name, task_id, args) {
        Ok(command) => command,
        Err(rejection) => return error_response(Some(request_id), command_field, &rejection),
    };

    log::debug!("[WsServer] {client_id} -> {name} ({request_id})");
    match api::dispatch(api, client_id, command).await {
        None => success_response(request_id, name, json!({ "result": "success" })),
        Some(Ok(payload)) => success_response(request_id, name, response_data(name, payload)),
        Some(Err(e)) => {
            let code = match e {
                ApiError::Internal(_) => WsErrorCode::ServerError,
                _ => WsErrorCode::ExecutionError,
            };
            error_response(Some(request_id), command_field, &Rejection::new(code, e.to_string()))
        }
    }
}

/// Maps `taskId` / `arguments` onto a typed command.
fn build_command(
    name: CommandName,
    task_id: Option<&str>,
    args: Option<&Map<String, Value>>,
) -> Result<TaskCommand, Rejection> {
    let arg = |key: &str| args.and_then(|a| a.get(key));
    let required_str = |key: &str| -> Result<Value, Rejection> {
        arg(key)
            .filter(|v| v.is_string())
            .cloned()
            .ok_or_else(|| {
                Rejection::new(WsErrorCode::InvalidParameter, format!("Missing '{key}' argument"))
            })
    };
    let task = || -> Result<Value, Rejection> {
        task_id
            .map(|id| json!(id))
            .or_else(|| arg("taskId").filter(|v| v.is_string()).cloned())
            .ok_or_else(|| Rejection::new(WsErrorCode::InvalidParameter, "Missing 'taskId'"))
    };

    let data = match name {
        CommandName::StartNewTask | CommandName::SendMessage => {
            args.map(|a| Value::Object(a.clone()))
        }
        CommandName::CancelTask
        | CommandName::CloseTask
        | CommandName::GetMessages
        | CommandName::GetTokenUsage
        | CommandName::ResumeTask
        | CommandName::IsTaskInHistory => Some(task()?),
        CommandName::ClearCurrentTask => arg("lastMessage").filter(|v| v.is_string()).cloned(),
        CommandName::SetConfiguration => match arg("values") {
            Some(values) if values.is_object() => Some(values.clone()),
            _ => {
                return Err(Rejection::new(
                    WsErrorCode::InvalidParameter,
                    "Missing or invalid 'values' argument",
                ))
            }
        },
        CommandName::Log => Some(required_str("message")?),
        CommandName::CreateProfile | CommandName::SetActiveProfile | CommandName::DeleteProfile => {
            Some(required_str("name")?)
        }
        CommandName::GetCurrentTaskStack
        | CommandName::CancelCurrentTask
        | CommandName::PressPrimaryButton
        | CommandName::PressSecondaryButton
        | CommandName::GetConfiguration
        | CommandName::IsReady
        | CommandName::GetProfiles
        | CommandName::GetActiveProfile => None,
    };

    TaskCommand::from_parts(name, data.as_ref())
        .map_err(|e| Rejection::new(WsErrorCode::InvalidParameter, e.to_string()))
}

/// Wraps a dispatcher payload in the field name this dialect uses.
fn response_data(name: CommandName, payload: Value) -> Value {
    let key = match name {
        CommandName::StartNewTask => "taskId",
        CommandName::GetCurrentTaskStack => "taskStack",
        CommandName::GetMessages => "messages",
        CommandName::GetTokenUsage => "usage",
        CommandName::IsReady => "ready",
        CommandName::GetConfiguration => "configuration",
        CommandName::IsTaskInHistory => "inHistory",
        CommandName::CreateProfile => "profileId",
        CommandName::GetProfiles => "profiles",
        CommandName::GetActiveProfile => "profile",
        _ => return json!({ "result": "success" }),
    };
    let mut data = Map::new();
    data.insert(key.to_string(), payload);
    Value::Object(data)
}

fn success_response(request_id: &str, name: CommandName, data: Value) -> Value {
    json!({
        "type": "response",
        "status": "success",
        "requestId": request_id,
        "commandName": name.ws_name(),
        "data": data,
    })
}

fn error_response(request_id: Option<&str>, command_name: Option<&str>, rejection: &Rejection) -> Value {
    json!({
        "type": "response",
        "status": "error",
        "requestId": request_id.unwrap_or("unknown"),
        "commandName": command_name.unwrap_or("unknown"),
        "error": { "code": rejection.code.as_str(), "message": rejection.message },
    })
}

/// `{type:"event", eventName, taskId?, payload}`; `None` for command responses.
fn event_message(event: &TaskEvent) -> Option<String> {
    if matches!(event, TaskEvent::CommandResponse(_)) {
        return None;
    }
    let mut message = Map::new();
    message.insert("type".into(), json!("event"));
    message.insert("eventName".into(), json!(event.name().as_str()));
    if let Some(task_id) = event.task_id() {
        message.insert("taskId".into(), json!(task_id));
    }
    message.insert("payload".into(), event.payload());
    Some(Value::Object(message).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::InMemoryEngine;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_json<S>(reader: &mut ws::WsReader<S>) -> Value
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match timeout(WAIT, reader.recv()).await.unwrap() {
            Some(Ok(WsMessage::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected text frame, got: {other:?}"),
        }
    }

    async fn roundtrip(request: Value) -> Value {
        let (engine, _events) = InMemoryEngine::new();
        handle_message(&engine, "ws-1", &request.to_string()).await
    }

    #[test]
    fn test_port_range() {
        assert!(validate_port(0).is_ok());
        assert!(validate_port(7800).is_ok());
        assert_eq!(validate_port(80), Err(ConfigError::InvalidWsPort(80)));
    }

    #[tokio::test]
    async fn test_error_codes() {
        let (engine, _events) = InMemoryEngine::new();
        let reply = handle_message(&engine, "ws-1", "{oops").await;
        assert_eq!(reply["error"]["code"], "INVALID_JSON");
        assert_eq!(reply["requestId"], "unknown");

        let reply = roundtrip(json!({"type": "hello", "requestId": "1"})).await;
        assert_eq!(reply["error"]["code"], "INVALID_COMMAND");

        let reply = roundtrip(json!({"type": "command", "commandName": "isReady"})).await;
        assert_eq!(reply["error"]["code"], "INVALID_PARAMETER");

        let reply = roundtrip(json!({"type": "command", "commandName": "explode", "requestId": "2"})).await;
        assert_eq!(reply["error"]["code"], "INVALID_COMMAND");
        assert_eq!(reply["requestId"], "2");

        let reply = roundtrip(json!({"type": "command", "commandName": "getMessages", "requestId": "3"})).await;
        assert_eq!(reply["error"]["code"], "INVALID_PARAMETER");

        let reply = roundtrip(json!({
            "type": "command", "commandName": "setConfiguration", "requestId": "4",
            "arguments": {"values": 3}
        }))
        .await;
        assert_eq!(reply["error"]["code"], "INVALID_PARAMETER");

        let reply = roundtrip(json!({
            "type": "command", "commandName": "cancelTask", "requestId": "5", "taskId": "nope"
        }))
        .await;
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"]["code"], "EXECUTION_ERROR");
        assert_eq!(reply["error"]["message"], "task nope not found");
    }

    #[tokio::test]
    async fn test_success_shapes() {
        let (engine, _events) = InMemoryEngine::new();
        let ready = handle_message(
            &engine,
            "ws-1",
            &json!({"type": "command", "commandName": "isReady", "requestId": "r"}).to_string(),
        )
        .await;
        assert_eq!(
            ready,
            json!({
                "type": "response", "status": "success", "requestId": "r",
                "commandName": "isReady", "data": {"ready": true}
            })
        );

        let started = handle_message(
            &engine,
            "ws-1",
            &json!({
                "type": "command", "commandName": "startNewTask", "requestId": "s",
                "arguments": {"text": "hello"}
            })
            .to_string(),
        )
        .await;
        let task_id = started["data"]["taskId"].as_str().unwrap().to_string();

        let messages = handle_message(
            &engine,
            "ws-1",
            &json!({
                "type": "command", "commandName": "getMessages", "requestId": "m", "taskId": task_id
            })
            .to_string(),
        )
        .await;
        assert_eq!(messages["data"]["messages"][0]["text"], "hello");

        let cleared = handle_message(
            &engine,
            "ws-1",
            &json!({"type": "command", "commandName": "clearCurrentTask", "requestId": "c"}).to_string(),
        )
        .await;
        assert_eq!(cleared["data"], json!({"result": "success"}));
    }

    #[test]
    fn test_event_message_shape() {
        let text = event_message(&TaskEvent::TaskSpawned("t".into(), "child".into())).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "event", "eventName": "taskSpawned", "taskId": "t", "payload": ["t", "child"]})
        );
    }

    #[tokio::test]
    async fn test_welcome_request_and_event_over_socket() {
        let (engine, events) = InMemoryEngine::new();
        let mut server = WsServer::start("127.0.0.1", 0, Arc::new(engine)).await.unwrap();
        server.forward_events(events);
        let (mut writer, mut reader) = ws::connect(&format!("ws://{}", server.local_addr()))
            .await
            .unwrap();

        let welcome = next_json(&mut reader).await;
        assert_eq!(welcome["requestId"], WS_WELCOME_REQUEST_ID);

        writer
            .send_text(
                &json!({
                    "type": "command", "commandName": "startNewTask", "requestId": "1",
                    "arguments": {"text": "go"}
                })
                .to_string(),
            )
            .await
            .unwrap();

        // The engine's events and the response interleave; collect until both seen.
        let mut saw_response = false;
        let mut saw_created = false;
        while !(saw_response && saw_created) {
            let frame = next_json(&mut reader).await;
            match frame["type"].as_str() {
                Some("response") => {
                    assert_eq!(frame["requestId"], "1");
                    saw_response = true;
                }
                Some("event") if frame["eventName"] == "taskCreated" => saw_created = true,
                _ => {}
            }
        }
        server.shutdown();
    }
}
