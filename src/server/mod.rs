//! Control-channel server.
//!
//! Binds a [`Listener`] and spawns two tasks: an accept loop that registers
//! each connection (fresh client id, Ack queued first) and a dispatch loop
//! that validates inbound frames and hands commands to the [`TaskApi`].
//!
//! ```text
//!   accept loop ──► ClientConn { read task, write task } ──┐
//!                                                          │ ConnEvent
//!   dispatch loop ◄────────────────────────────────────────┘
//!        │  TaskCommand
//!        └─► tokio::spawn(api::dispatch) ─► commandResponse (unicast)
//! ```
//!
//! Events produced by the engine reach clients through
//! [`ServerHandle::broadcast`] / [`ServerHandle::send`] or
//! [`Server::forward_events`].

mod client_conn;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, TaskApi};
use crate::config::ServerConfig;
use crate::constants::SERVER_EVENT_CAPACITY;
use crate::framing::WireCodec;
use crate::protocol::{parse_frame, Ack, CommandRequest, CommandResponse, Envelope, TaskEvent};
use crate::transport::{Accepted, Endpoint, Listener};
use client_conn::{ClientConn, ConnEvent};

/// Local notifications about connected clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client connected and was sent its Ack.
    Connect {
        /// Assigned id.
        client_id: String,
    },
    /// A registered client went away.
    Disconnect {
        /// Id of the departed client.
        client_id: String,
    },
    /// A frame from the client was dropped; the connection stays open.
    Rejected {
        /// Sender.
        client_id: String,
        /// Validation failure or unexpected envelope.
        reason: String,
    },
}

struct Shared {
    clients: Mutex<HashMap<String, ClientConn>>,
    events: broadcast::Sender<ServerEvent>,
}

/// Cloneable handle for pushing events to clients.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    fn new() -> Self {
        let (events, _) = broadcast::channel(SERVER_EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                clients: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, ClientConn>> {
        self.shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    /// Sends `event` to every connected client.
    ///
    /// Best effort: returns how many clients it was queued for.
    pub fn broadcast(&self, event: TaskEvent) -> usize {
        let name = event.name();
        let json = Envelope::event(event).encode();
        let clients = self.clients();
        let delivered = clients.values().filter(|c| c.send_json(&json)).count();
        log::trace!(
            "[Server] Broadcast {name} to {delivered}/{} clients",
            clients.len()
        );
        delivered
    }

    /// Sends `event` to one client, tagged with `relayClientId`.
    ///
    /// An unknown id is a silent drop.
    pub fn send(&self, client_id: &str, event: TaskEvent) -> bool {
        let clients = self.clients();
        let Some(conn) = clients.get(client_id) else {
            log::debug!("[Server] Dropping {} for unknown client {client_id}", event.name());
            return false;
        };
        conn.send_envelope(&Envelope::relay(client_id, event))
    }

    /// Local connect/disconnect notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Ids of connected clients, sorted.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registers an accepted connection and queues its Ack.
    ///
    /// Construction and insertion happen under the table lock, so nothing
    /// the connection sends can be dispatched before it is addressable.
    fn register(
        &self,
        accepted: Accepted,
        codec: WireCodec,
        conn_seq: u64,
        queue_capacity: usize,
        conn_tx: &UnboundedSender<ConnEvent>,
    ) -> String {
        let peer = accepted.peer.clone();
        let mut clients = self.clients();
        let client_id = loop {
            let id = generate_client_id();
            if !clients.contains_key(&id) {
                break id;
            }
        };
        let conn = ClientConn::new(
            client_id.clone(),
            conn_seq,
            accepted,
            codec,
            queue_capacity,
            conn_tx.clone(),
        );
        conn.send_envelope(&Envelope::ack(Ack::for_current_process(&client_id)));
        clients.insert(client_id.clone(), conn);
        drop(clients);

        log::info!("[Server] Client connected: {client_id} ({peer})");
        self.notify(ServerEvent::Connect {
            client_id: client_id.clone(),
        });
        client_id
    }

    /// Removes `client_id` if it is still the connection numbered `conn_seq`.
    fn remove(&self, client_id: &str, conn_seq: u64) {
        let removed = {
            let mut clients = self.clients();
            match clients.get(client_id) {
                Some(conn) if conn.conn_seq() == conn_seq => clients.remove(client_id),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            conn.disconnect();
            log::info!("[Server] Client removed: {client_id}");
            self.notify(ServerEvent::Disconnect {
                client_id: client_id.to_string(),
            });
        }
    }

    fn disconnect_all(&self) {
        let drained: Vec<ClientConn> = self.clients().drain().map(|(_, conn)| conn).collect();
        for conn in drained {
            conn.disconnect();
        }
    }
}

/// A bound control-channel server.
pub struct Server {
    handle: ServerHandle,
    api: Arc<dyn TaskApi>,
    listener: Arc<Listener>,
    endpoint: Endpoint,
    queue_capacity: usize,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    listening: bool,
    stopped: bool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.endpoint)
            .field("listening", &self.listening)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Binds the listener without accepting yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the address or socket path cannot be bound.
    pub async fn bind(config: ServerConfig, api: Arc<dyn TaskApi>) -> Result<Self> {
        let listener = Listener::bind(&config.transport).await?;
        let endpoint = listener.endpoint()?;
        log::info!("[Server] Listening on {endpoint}");
        Ok(Self {
            handle: ServerHandle::new(),
            api,
            listener: Arc::new(listener),
            endpoint,
            queue_capacity: config.outbound_queue_capacity,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            listening: false,
            stopped: false,
        })
    }

    /// Binds and starts accepting.
    pub async fn start(config: ServerConfig, api: Arc<dyn TaskApi>) -> Result<Self> {
        let mut server = Self::bind(config, api).await?;
        server.listen();
        Ok(server)
    }

    /// Spawns the accept and dispatch loops. Idempotent.
    pub fn listen(&mut self) {
        if self.listening {
            return;
        }
        self.listening = true;

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        self.tasks.push(tokio::spawn(accept_loop(
            Arc::clone(&self.listener),
            self.handle.clone(),
            conn_tx,
            self.queue_capacity,
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(dispatch_loop(
            conn_rx,
            self.handle.clone(),
            Arc::clone(&self.api),
            self.cancel.clone(),
        )));
    }

    /// Broadcasts every event received on `events` until it closes or the
    /// server shuts down.
    pub fn forward_events(&mut self, mut events: UnboundedReceiver<TaskEvent>) {
        let handle = self.handle.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            handle.broadcast(event);
                        }
                        None => break,
                    },
                }
            }
        }));
    }

    /// Where the server is bound (real port when bound to port 0).
    pub fn local_addr(&self) -> &Endpoint {
        &self.endpoint
    }

    /// A cloneable handle for pushing events.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// See [`ServerHandle::broadcast`].
    pub fn broadcast(&self, event: TaskEvent) -> usize {
        self.handle.broadcast(event)
    }

    /// See [`ServerHandle::send`].
    pub fn send(&self, client_id: &str, event: TaskEvent) -> bool {
        self.handle.send(client_id, event)
    }

    /// See [`ServerHandle::subscribe`].
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.handle.subscribe()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.handle.client_count()
    }

    /// Ids of connected clients, sorted.
    pub fn client_ids(&self) -> Vec<String> {
        self.handle.client_ids()
    }

    /// Stops accepting, disconnects every client and removes the socket file.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.handle.disconnect_all();
        self.listener.cleanup();
        log::info!("[Server] Stopped listening on {}", self.endpoint);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: Arc<Listener>,
    handle: ServerHandle,
    conn_tx: UnboundedSender<ConnEvent>,
    queue_capacity: usize,
    cancel: CancellationToken,
) {
    let codec = listener.codec();
    let mut conn_seq = 0u64;
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(accepted) => {
                conn_seq += 1;
                handle.register(accepted, codec, conn_seq, queue_capacity, &conn_tx);
            }
            Err(e) => {
                log::error!("[Server] Accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn dispatch_loop(
    mut conn_rx: UnboundedReceiver<ConnEvent>,
    handle: ServerHandle,
    api: Arc<dyn TaskApi>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = conn_rx.recv() => event,
        };
        match event {
            Some(ConnEvent::Frame {
                client_id, text, ..
            }) => handle_frame(&handle, &api, client_id, &text),
            Some(ConnEvent::Closed {
                client_id,
                conn_seq,
            }) => handle.remove(&client_id, conn_seq),
            None => break,
        }
    }
}

/// Validates one inbound frame and dispatches it if it is a command.
fn handle_frame(handle: &ServerHandle, api: &Arc<dyn TaskApi>, client_id: String, text: &str) {
    let reject = |reason: String| {
        log::warn!("[Server] Dropping frame from {client_id}: {reason}");
        handle.notify(ServerEvent::Rejected {
            client_id: client_id.clone(),
            reason,
        });
    };

    let request = match parse_frame(text) {
        Ok(Envelope::TaskCommand {
            client_id: claimed,
            request,
        }) => {
            if claimed != client_id {
                log::warn!("[Server] Client {client_id} claimed id {claimed:?}; ignoring claim");
            }
            request
        }
        Ok(other) => {
            reject(format!(
                "unexpected {} envelope from a client",
                other.message_type()
            ));
            return;
        }
        Err(e) => {
            reject(e.to_string());
            return;
        }
    };

    let CommandRequest {
        request_id,
        command,
    } = request;
    let command_name = command.name();
    log::debug!("[Server] {client_id} -> {command_name} ({request_id:?})");

    let handle = handle.clone();
    let api = Arc::clone(api);
    tokio::spawn(async move {
        let Some(result) = api::dispatch(api.as_ref(), &client_id, command).await else {
            return;
        };
        let request_id = request_id.unwrap_or_default();
        let response = match result {
            Ok(payload) => CommandResponse::success(command_name, request_id, payload),
            Err(e) => {
                log::debug!("[Server] {command_name} failed for {client_id}: {e}");
                CommandResponse::failure(command_name, request_id, e.to_string())
            }
        };
        handle.send(&client_id, TaskEvent::CommandResponse(response));
    });
}

/// Six random bytes, lowercase hex.
fn generate_client_id() -> String {
    let bytes: [u8; 6] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::InMemoryEngine;
    use crate::config::TransportConfig;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct RawClient {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl RawClient {
        async fn connect(server: &Server) -> Self {
            let Endpoint::Tcp(addr) = server.local_addr() else {
                panic!("expected tcp endpoint");
            };
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn next(&mut self) -> Value {
            let line = timeout(WAIT, self.lines.next_line())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .expect("connection closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: &Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }
    }

    async fn start_server() -> Server {
        let (engine, _events) = InMemoryEngine::new();
        Server::start(
            ServerConfig::new(TransportConfig::tcp("127.0.0.1", 0)),
            Arc::new(engine),
        )
        .await
        .unwrap()
    }

    async fn next_server_event(rx: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_client_id_shape() {
        let id = generate_client_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_client_id());
    }

    #[tokio::test]
    async fn test_ack_first_then_command_reply_is_unicast() {
        let server = start_server().await;
        let mut events = server.subscribe();
        let mut client = RawClient::connect(&server).await;

        let ack = client.next().await;
        assert_eq!(ack["type"], "Ack");
        assert_eq!(ack["origin"], "server");
        assert_eq!(ack["data"]["pid"], json!(std::process::id()));
        let client_id = ack["data"]["clientId"].as_str().unwrap().to_string();
        assert_eq!(
            next_server_event(&mut events).await,
            ServerEvent::Connect {
                client_id: client_id.clone()
            }
        );
        assert_eq!(server.client_ids(), vec![client_id.clone()]);

        client
            .send(&json!({
                "type": "TaskCommand", "origin": "client", "clientId": client_id,
                "data": {"commandName": "IsReady", "requestId": "r-1"}
            }))
            .await;
        let reply = client.next().await;
        assert_eq!(reply["relayClientId"], json!(client_id));
        assert_eq!(reply["data"]["eventName"], "commandResponse");
        assert_eq!(
            reply["data"]["payload"][0],
            json!({"commandName": "IsReady", "requestId": "r-1", "payload": true})
        );
    }

    #[tokio::test]
    async fn test_invalid_frames_keep_connection_alive() {
        let server = start_server().await;
        let mut events = server.subscribe();
        let mut client = RawClient::connect(&server).await;
        let client_id = client.next().await["data"]["clientId"]
            .as_str()
            .unwrap()
            .to_string();
        next_server_event(&mut events).await;

        client.writer.write_all(b"{not json\n").await.unwrap();
        client
            .send(&json!({"type": "TaskEvent", "origin": "server", "data": {}}))
            .await;
        for _ in 0..2 {
            match next_server_event(&mut events).await {
                ServerEvent::Rejected { client_id: id, .. } => assert_eq!(id, client_id),
                other => panic!("Expected Rejected, got: {other:?}"),
            }
        }

        // Commands with an error reply still arrive afterwards.
        client
            .send(&json!({
                "type": "TaskCommand", "origin": "client", "clientId": "forged",
                "data": {"commandName": "CancelTask", "requestId": "r-2", "data": "missing"}
            }))
            .await;
        let reply = client.next().await;
        assert_eq!(reply["relayClientId"], json!(client_id));
        assert_eq!(
            reply["data"]["payload"][0]["error"],
            "task missing not found"
        );
    }

    #[tokio::test]
    async fn test_broadcast_and_unicast() {
        let server = start_server().await;
        let mut events = server.subscribe();
        let mut a = RawClient::connect(&server).await;
        let mut b = RawClient::connect(&server).await;
        let a_id = a.next().await["data"]["clientId"].as_str().unwrap().to_string();
        b.next().await;
        next_server_event(&mut events).await;
        next_server_event(&mut events).await;

        assert_eq!(server.broadcast(TaskEvent::TaskStarted("task-1".into())), 2);
        for client in [&mut a, &mut b] {
            let frame = client.next().await;
            assert!(frame.get("relayClientId").is_none());
            assert_eq!(
                frame["data"],
                json!({"eventName": "taskStarted", "payload": ["task-1"]})
            );
        }

        assert!(!server.send("nobody", TaskEvent::TaskAborted("t".into())));
        assert!(server.send(&a_id, TaskEvent::TaskAborted("t".into())));
        assert_eq!(a.next().await["data"]["eventName"], "taskAborted");
        let nothing = timeout(Duration::from_millis(150), b.lines.next_line()).await;
        assert!(nothing.is_err(), "b received a unicast: {nothing:?}");
    }

    #[tokio::test]
    async fn test_disconnect_is_reported_once() {
        let server = start_server().await;
        let mut events = server.subscribe();
        let mut client = RawClient::connect(&server).await;
        let client_id = client.next().await["data"]["clientId"]
            .as_str()
            .unwrap()
            .to_string();
        next_server_event(&mut events).await;

        drop(client);
        assert_eq!(
            next_server_event(&mut events).await,
            ServerEvent::Disconnect {
                client_id: client_id.clone()
            }
        );
        assert_eq!(server.client_count(), 0);

        // A stale close for the same id is a no-op.
        server.handle.remove(&client_id, 1);
        let extra = timeout(Duration::from_millis(150), events.recv()).await;
        assert!(extra.is_err(), "second Disconnect emitted: {extra:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_removes_socket_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("srv.sock");
        let (engine, _events) = InMemoryEngine::new();
        let server = Server::start(ServerConfig::new(TransportConfig::local(&path)), Arc::new(engine))
            .await
            .unwrap();
        assert!(path.exists());
        server.shutdown();
        assert!(!path.exists());
    }
}
