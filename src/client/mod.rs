//! Control-channel client.
//!
//! A [`Client`] owns one [`Transport`] and a router task that consumes its
//! events:
//!
//! - `Ack` marks the session ready and stores the assigned client id;
//! - `commandResponse` settles the pending call with the same request id;
//! - every other event fans out to subscribers of its [`EventName`];
//! - `Close` rejects every pending call with [`ClientError::Disconnected`].
//!
//! Calls are correlated by a per-call id (`{clientId}-{seq}`), never by
//! client id, so any number may be in flight at once.

mod pending;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::protocol::{
    parse_frame, Ack, ClineMessage, CommandName, Envelope, EventName, SendMessage, StartNewTask,
    TaskCommand, TaskEvent, TokenUsage,
};
use crate::transport::{self, Transport, TransportError, TransportEvent};
use pending::PendingRequests;

/// Why a client operation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The transport is not connected.
    #[error("not connected")]
    NotConnected,
    /// Connected, but the server has not sent its Ack yet.
    #[error("not ready: no Ack received")]
    NotReady,
    /// The server never sent an Ack.
    #[error("no Ack within {0:?}")]
    HandshakeTimeout(Duration),
    /// No response within the command's deadline.
    #[error("{command} timed out after {elapsed:?}")]
    Timeout {
        /// The command that timed out.
        command: CommandName,
        /// How long the call waited.
        elapsed: Duration,
    },
    /// The engine reported a failure.
    #[error("{0}")]
    Command(String),
    /// The connection closed while the call was in flight.
    #[error("disconnected before a response arrived")]
    Disconnected,
    /// A request id was already in flight.
    #[error("request id {0} already in flight")]
    DuplicateRequest(String),
    /// The response payload did not have the expected shape.
    #[error("unexpected {command} response: {reason}")]
    Decode {
        /// The command whose payload failed to decode.
        command: CommandName,
        /// Decoder message.
        reason: String,
    },
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Diagnostics that are not tied to any call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotice {
    /// A `commandResponse` arrived for no pending call (e.g. after a timeout).
    UnmatchedResponse {
        /// Correlation id on the response.
        request_id: String,
        /// Command it answered.
        command_name: CommandName,
    },
    /// An inbound frame failed validation and was dropped.
    InvalidFrame(String),
    /// The transport reported a non-fatal error.
    TransportError(String),
    /// The connection closed.
    Disconnected,
}

#[derive(Debug, Default)]
struct Subscribers {
    by_name: HashMap<EventName, Vec<UnboundedSender<TaskEvent>>>,
    all: Vec<UnboundedSender<TaskEvent>>,
}

impl Subscribers {
    /// Delivers `event` and prunes closed receivers.
    fn publish(&mut self, event: &TaskEvent) {
        if let Some(subs) = self.by_name.get_mut(&event.name()) {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
        self.all.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// State shared between the client and its router task.
#[derive(Debug)]
struct Shared {
    connected: AtomicBool,
    ack: watch::Sender<Option<Ack>>,
    pending: PendingRequests,
    seq: AtomicU64,
    subscribers: Mutex<Subscribers>,
    notices: Mutex<Vec<UnboundedSender<ClientNotice>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn notice(&self, notice: ClientNotice) {
        lock(&self.notices).retain(|tx| tx.send(notice.clone()).is_ok());
    }

    fn client_id(&self) -> Option<String> {
        self.ack.borrow().as_ref().map(|ack| ack.client_id.clone())
    }

    fn route_frame(&self, text: &str) {
        match parse_frame(text) {
            Ok(Envelope::Ack(ack)) => {
                log::info!("[Client] Ready as {} (server pid {})", ack.client_id, ack.pid);
                self.ack.send_replace(Some(ack));
            }
            Ok(Envelope::TaskEvent {
                event: TaskEvent::CommandResponse(response),
                ..
            }) => {
                let request_id = response.request_id.clone();
                let command_name = response.command_name;
                let reply = response.into_result().map_err(ClientError::Command);
                if self.pending.resolve(&request_id, reply).is_none() {
                    log::debug!("[Client] Unmatched {command_name} response {request_id}");
                    self.notice(ClientNotice::UnmatchedResponse {
                        request_id,
                        command_name,
                    });
                }
            }
            Ok(Envelope::TaskEvent { event, .. }) => {
                lock(&self.subscribers).publish(&event);
            }
            Ok(other) => {
                log::warn!("[Client] Unexpected {} envelope from server", other.message_type());
                self.notice(ClientNotice::InvalidFrame(format!(
                    "unexpected {} envelope",
                    other.message_type()
                )));
            }
            Err(e) => {
                log::warn!("[Client] Dropping invalid frame: {e}");
                self.notice(ClientNotice::InvalidFrame(e.to_string()));
            }
        }
    }

    /// Clears the session and rejects in-flight calls. Runs once per connection.
    fn on_close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.ack.send_replace(None);
        let failed = self.pending.fail_all(&ClientError::Disconnected);
        log::info!("[Client] Disconnected ({failed} pending call(s) failed)");
        self.notice(ClientNotice::Disconnected);
    }
}

type SharedTransport = Arc<tokio::sync::Mutex<Box<dyn Transport>>>;

/// RPC client for the task engine.
pub struct Client {
    config: ClientConfig,
    transport: SharedTransport,
    shared: Arc<Shared>,
    events: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.config.transport.describe())
            .field("client_id", &self.shared.client_id())
            .field("pending", &self.shared.pending.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// A client for the transport named in `config`. Does not connect.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = transport::from_config(&config.transport, config.retry_interval)?;
        Ok(Self::with_transport(config, transport))
    }

    /// A client over a caller-supplied transport.
    pub fn with_transport(config: ClientConfig, mut transport: Box<dyn Transport>) -> Self {
        let events = transport.take_events();
        let (ack, _) = watch::channel(None);
        Self {
            config,
            transport: Arc::new(tokio::sync::Mutex::new(transport)),
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                ack,
                pending: PendingRequests::default(),
                seq: AtomicU64::new(0),
                subscribers: Mutex::new(Subscribers::default()),
                notices: Mutex::new(Vec::new()),
            }),
            events: Mutex::new(events),
            router: Mutex::new(None),
        }
    }

    fn start_router(&self) {
        let mut router = lock(&self.router);
        if router.is_some() {
            return;
        }
        let Some(mut events) = lock(&self.events).take() else {
            log::warn!("[Client] Transport event stream unavailable");
            return;
        };
        let shared = Arc::clone(&self.shared);
        let transport = Arc::clone(&self.transport);
        *router = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Data(text) => shared.route_frame(&text),
                    TransportEvent::Error(message) => {
                        log::warn!("[Client] Transport error: {message}");
                        shared.notice(ClientNotice::TransportError(message));
                    }
                    TransportEvent::Close => {
                        // A Close from an earlier connection must not end a newer one.
                        if !transport.lock().await.is_connected() {
                            shared.on_close();
                        }
                    }
                }
            }
        }));
    }

    /// Connects and waits for the server's Ack.
    ///
    /// Both steps share the configured connect timeout. Connecting a ready
    /// client returns the current Ack.
    pub async fn connect(&self) -> Result<Ack, ClientError> {
        if self.is_connected() {
            if let Some(ack) = self.ack() {
                return Ok(ack);
            }
        }
        self.start_router();
        let mut ack_rx = self.shared.ack.subscribe();
        let timeout = self.config.connect_timeout;
        let started = Instant::now();

        {
            let mut transport = self.transport.lock().await;
            transport.connect(timeout).await?;
            self.shared.connected.store(true, Ordering::SeqCst);
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        let acked = match tokio::time::timeout(remaining, ack_rx.wait_for(Option::is_some)).await
        {
            Ok(Ok(ack)) => (*ack).clone(),
            Ok(Err(_)) => return Err(ClientError::Disconnected),
            Err(_) => None,
        };
        if let Some(ack) = acked {
            return Ok(ack);
        }
        log::warn!("[Client] No Ack within {timeout:?}; disconnecting");
        self.disconnect().await;
        Err(ClientError::HandshakeTimeout(timeout))
    }

    /// Closes the connection. Pending calls fail with `Disconnected`.
    pub async fn disconnect(&self) {
        self.transport.lock().await.disconnect().await;
        self.shared.on_close();
    }

    /// Whether the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether the Ack has been received on the current connection.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.shared.ack.borrow().is_some()
    }

    /// Client id assigned by the server, while ready.
    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id()
    }

    /// The Ack of the current connection.
    pub fn ack(&self) -> Option<Ack> {
        self.shared.ack.borrow().clone()
    }

    /// Receives every event named `name`.
    pub fn subscribe(&self, name: EventName) -> UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers)
            .by_name
            .entry(name)
            .or_default()
            .push(tx);
        rx
    }

    /// Receives every event except command responses.
    pub fn subscribe_all(&self) -> UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers).all.push(tx);
        rx
    }

    /// Diagnostic stream: unmatched responses, invalid frames, disconnects.
    pub fn notices(&self) -> UnboundedReceiver<ClientNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.notices).push(tx);
        rx
    }

    /// Sends `command` and waits for its response payload.
    ///
    /// Commands that never get a reply (`Log`) resolve to `Null` once queued.
    pub async fn send_command(&self, command: TaskCommand) -> Result<Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let client_id = self.client_id().ok_or(ClientError::NotReady)?;
        let command_name = command.name();

        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let request_id = format!("{client_id}-{seq}");
        let envelope = Envelope::command(client_id, &request_id, command);

        if !command_name.expects_response() {
            self.transport.lock().await.send(&envelope.encode())?;
            return Ok(Value::Null);
        }

        let reply = self
            .shared
            .pending
            .insert(&request_id, command_name)
            .ok_or_else(|| ClientError::DuplicateRequest(request_id.clone()))?;
        // Registered before this check, so a close from here on reaches it.
        if !self.is_connected() {
            self.shared.pending.remove(&request_id);
            return Err(ClientError::Disconnected);
        }
        if let Err(e) = self.transport.lock().await.send(&envelope.encode()) {
            self.shared.pending.remove(&request_id);
            return Err(e.into());
        }
        log::debug!("[Client] {command_name} sent as {request_id}");

        let limit = self.config.timeout_for(command_name);
        let started = Instant::now();
        match tokio::time::timeout(limit, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                let elapsed = started.elapsed();
                log::warn!("[Client] {command_name} ({request_id}) timed out after {elapsed:?}");
                Err(ClientError::Timeout {
                    command: command_name,
                    elapsed,
                })
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, command: TaskCommand) -> Result<T, ClientError> {
        let command_name = command.name();
        let payload = self.send_command(command).await?;
        serde_json::from_value(payload).map_err(|e| ClientError::Decode {
            command: command_name,
            reason: e.to_string(),
        })
    }

    async fn call_unit(&self, command: TaskCommand) -> Result<(), ClientError> {
        self.send_command(command).await.map(drop)
    }

    /// Starts a task; returns its id.
    pub async fn start_new_task(&self, task: StartNewTask) -> Result<String, ClientError> {
        self.call(TaskCommand::StartNewTask(task)).await
    }

    /// Aborts the task `task_id`.
    pub async fn cancel_task(&self, task_id: impl Into<String>) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::CancelTask(task_id.into())).await
    }

    /// Closes `task_id`, which must be the current task.
    pub async fn close_task(&self, task_id: impl Into<String>) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::CloseTask(task_id.into())).await
    }

    /// Ids of the active task stack, innermost last.
    pub async fn get_current_task_stack(&self) -> Result<Vec<String>, ClientError> {
        self.call(TaskCommand::GetCurrentTaskStack).await
    }

    /// Finishes the current task, optionally recording a final message.
    pub async fn clear_current_task(&self, last_message: Option<String>) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::ClearCurrentTask(last_message)).await
    }

    /// Aborts the current task, if any.
    pub async fn cancel_current_task(&self) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::CancelCurrentTask).await
    }

    /// Answers the current task.
    pub async fn send_message(&self, message: SendMessage) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::SendMessage(message)).await
    }

    /// Approves the pending ask.
    pub async fn press_primary_button(&self) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::PressPrimaryButton).await
    }

    /// Rejects the pending ask.
    pub async fn press_secondary_button(&self) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::PressSecondaryButton).await
    }

    /// Merges `values` into the engine configuration.
    pub async fn set_configuration(&self, values: Value) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::SetConfiguration(values)).await
    }

    /// Current engine configuration.
    pub async fn get_configuration(&self) -> Result<Value, ClientError> {
        self.send_command(TaskCommand::GetConfiguration).await
    }

    /// Whether the engine is ready for tasks (the `IsReady` command).
    pub async fn is_engine_ready(&self) -> Result<bool, ClientError> {
        self.call(TaskCommand::IsReady).await
    }

    /// Transcript of `task_id`; empty for unknown tasks.
    pub async fn get_messages(
        &self,
        task_id: impl Into<String>,
    ) -> Result<Vec<ClineMessage>, ClientError> {
        self.call(TaskCommand::GetMessages(task_id.into())).await
    }

    /// Token accounting for `task_id`, if known.
    pub async fn get_token_usage(
        &self,
        task_id: impl Into<String>,
    ) -> Result<Option<TokenUsage>, ClientError> {
        self.call(TaskCommand::GetTokenUsage(task_id.into())).await
    }

    /// Writes to the engine's log. Never answered.
    pub async fn log(&self, message: impl Into<String>) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::Log(message.into())).await
    }

    /// Reopens a task from history.
    pub async fn resume_task(&self, task_id: impl Into<String>) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::ResumeTask(task_id.into())).await
    }

    /// Whether `task_id` is in history.
    pub async fn is_task_in_history(&self, task_id: impl Into<String>) -> Result<bool, ClientError> {
        self.call(TaskCommand::IsTaskInHistory(task_id.into())).await
    }

    /// Creates a profile; returns its id.
    pub async fn create_profile(&self, name: impl Into<String>) -> Result<String, ClientError> {
        self.call(TaskCommand::CreateProfile(name.into())).await
    }

    /// Profile names.
    pub async fn get_profiles(&self) -> Result<Vec<String>, ClientError> {
        self.call(TaskCommand::GetProfiles).await
    }

    /// Switches the active profile.
    pub async fn set_active_profile(&self, name: impl Into<String>) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::SetActiveProfile(name.into())).await
    }

    /// Name of the active profile.
    pub async fn get_active_profile(&self) -> Result<Option<String>, ClientError> {
        self.call(TaskCommand::GetActiveProfile).await
    }

    /// Deletes a profile.
    pub async fn delete_profile(&self, name: impl Into<String>) -> Result<(), ClientError> {
        self.call_unit(TaskCommand::DeleteProfile(name.into())).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(router) = lock(&self.router).take() {
            router.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::protocol::CommandResponse;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// In-process transport: the test plays the server.
    #[derive(Debug)]
    struct MockTransport {
        connected: Arc<AtomicBool>,
        sent: UnboundedSender<String>,
        events_tx: UnboundedSender<TransportEvent>,
        events_rx: Option<UnboundedReceiver<TransportEvent>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&mut self, _timeout: Duration) -> Result<(), TransportError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn send(&self, json: &str) -> Result<(), TransportError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.sent.send(json.to_string()).map_err(|_| TransportError::NotConnected)
        }

        async fn disconnect(&mut self) {
            if self.connected.swap(false, Ordering::SeqCst) {
                let _ = self.events_tx.send(TransportEvent::Close);
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn take_events(&mut self) -> Option<UnboundedReceiver<TransportEvent>> {
            self.events_rx.take()
        }

        fn endpoint(&self) -> String {
            "mock".to_string()
        }
    }

    struct Peer {
        connected: Arc<AtomicBool>,
        sent: UnboundedReceiver<String>,
        events: UnboundedSender<TransportEvent>,
    }

    impl Peer {
        fn push(&self, envelope: &Envelope) {
            self.events
                .send(TransportEvent::Data(envelope.encode()))
                .unwrap();
        }

        fn ack(&self, client_id: &str) {
            self.push(&Envelope::ack(Ack {
                client_id: client_id.into(),
                pid: 1,
                ppid: 0,
            }));
        }

        /// Next command the client sent: (request id, command name).
        async fn next_request(&mut self) -> (String, CommandName) {
            let text = timeout(WAIT, self.sent.recv()).await.unwrap().unwrap();
            match parse_frame(&text).unwrap() {
                Envelope::TaskCommand { request, .. } => {
                    (request.request_id.unwrap(), request.command.name())
                }
                other => panic!("Expected TaskCommand, got: {other:?}"),
            }
        }

        fn respond(&self, response: CommandResponse) {
            self.push(&Envelope::relay("c", TaskEvent::CommandResponse(response)));
        }

        fn drop_connection(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.events.send(TransportEvent::Close).unwrap();
        }
    }

    fn mock_client(request_timeout: Duration) -> (Client, Peer) {
        let connected = Arc::new(AtomicBool::new(false));
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = MockTransport {
            connected: Arc::clone(&connected),
            sent: sent_tx,
            events_tx: events_tx.clone(),
            events_rx: Some(events_rx),
        };
        let config = ClientConfig::new(TransportConfig::tcp("127.0.0.1", 1))
            .with_connect_timeout(Duration::from_millis(300))
            .with_request_timeouts(request_timeout, request_timeout);
        let client = Client::with_transport(config, Box::new(transport));
        let peer = Peer {
            connected,
            sent: sent_rx,
            events: events_tx,
        };
        (client, peer)
    }

    async fn ready_client(request_timeout: Duration) -> (Arc<Client>, Peer) {
        let (client, peer) = mock_client(request_timeout);
        peer.ack("c");
        let ack = client.connect().await.unwrap();
        assert_eq!(ack.client_id, "c");
        (Arc::new(client), peer)
    }

    #[tokio::test]
    async fn test_rejects_before_connect_and_before_ack() {
        let (client, _peer) = mock_client(WAIT);
        assert_eq!(
            client.send_command(TaskCommand::IsReady).await,
            Err(ClientError::NotConnected)
        );

        let err = client.connect().await.unwrap_err();
        assert_eq!(err, ClientError::HandshakeTimeout(Duration::from_millis(300)));
        assert!(!client.is_connected());
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate_by_request_id() {
        let (client, mut peer) = ready_client(WAIT).await;
        assert!(client.is_ready());

        let first = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.get_profiles().await }
        });
        let (id1, _) = peer.next_request().await;
        let second = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.is_engine_ready().await }
        });
        let (id2, name2) = peer.next_request().await;
        assert_eq!(id1, "c-1");
        assert_eq!(id2, "c-2");
        assert_eq!(name2, CommandName::IsReady);

        peer.respond(CommandResponse::success(CommandName::IsReady, &id2, json!(true)));
        assert_eq!(timeout(WAIT, second).await.unwrap().unwrap(), Ok(true));
        assert!(!first.is_finished());

        peer.respond(CommandResponse::success(
            CommandName::GetProfiles,
            &id1,
            json!(["default", "work"]),
        ));
        assert_eq!(
            timeout(WAIT, first).await.unwrap().unwrap(),
            Ok(vec!["default".to_string(), "work".to_string()])
        );
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_unmatched() {
        let (client, mut peer) = ready_client(Duration::from_millis(100)).await;
        let mut notices = client.notices();

        let err = client.is_engine_ready().await.unwrap_err();
        assert!(
            matches!(err, ClientError::Timeout { command: CommandName::IsReady, elapsed } if elapsed >= Duration::from_millis(100)),
            "got {err:?}"
        );
        let (request_id, _) = peer.next_request().await;

        peer.respond(CommandResponse::success(CommandName::IsReady, &request_id, json!(true)));
        let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
        assert_eq!(
            notice,
            ClientNotice::UnmatchedResponse {
                request_id,
                command_name: CommandName::IsReady
            }
        );
    }

    #[tokio::test]
    async fn test_error_reply_and_decode_failure() {
        let (client, mut peer) = ready_client(WAIT).await;

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.cancel_task("t").await }
        });
        let (id, _) = peer.next_request().await;
        peer.respond(CommandResponse::failure(CommandName::CancelTask, &id, "task t not found"));
        assert_eq!(
            timeout(WAIT, call).await.unwrap().unwrap(),
            Err(ClientError::Command("task t not found".into()))
        );

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.is_engine_ready().await }
        });
        let (id, _) = peer.next_request().await;
        peer.respond(CommandResponse::success(CommandName::IsReady, &id, json!("yes")));
        let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Decode { command: CommandName::IsReady, .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls_immediately() {
        let (client, mut peer) = ready_client(Duration::from_secs(30)).await;
        let mut notices = client.notices();

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.start_new_task(StartNewTask::new("hi")).await }
        });
        peer.next_request().await;
        peer.drop_connection();

        assert_eq!(
            timeout(WAIT, call).await.unwrap().unwrap(),
            Err(ClientError::Disconnected)
        );
        assert_eq!(
            timeout(WAIT, notices.recv()).await.unwrap(),
            Some(ClientNotice::Disconnected)
        );
        assert!(!client.is_ready());
        assert_eq!(client.client_id(), None);
    }

    #[tokio::test]
    async fn test_events_fan_out_and_log_is_fire_and_forget() {
        let (client, mut peer) = ready_client(WAIT).await;
        let mut started = client.subscribe(EventName::TaskStarted);
        let mut started_again = client.subscribe(EventName::TaskStarted);
        let mut all = client.subscribe_all();
        drop(client.subscribe(EventName::TaskStarted));

        peer.push(&Envelope::event(TaskEvent::TaskStarted("task-1".into())));
        peer.push(&Envelope::event(TaskEvent::TaskAborted("task-1".into())));

        for rx in [&mut started, &mut started_again] {
            assert_eq!(
                timeout(WAIT, rx.recv()).await.unwrap(),
                Some(TaskEvent::TaskStarted("task-1".into()))
            );
        }
        assert_eq!(
            timeout(WAIT, all.recv()).await.unwrap(),
            Some(TaskEvent::TaskStarted("task-1".into()))
        );
        assert_eq!(
            timeout(WAIT, all.recv()).await.unwrap(),
            Some(TaskEvent::TaskAborted("task-1".into()))
        );
        assert!(started.try_recv().is_err());

        client.log("hello").await.unwrap();
        let (_, name) = peer.next_request().await;
        assert_eq!(name, CommandName::Log);
    }
}
