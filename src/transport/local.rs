//! Local channel transport: a Unix domain socket speaking node-ipc framing.
//!
//! The peer library retries connecting until the server creates its socket,
//! so this transport does the same: attempts are repeated every
//! `retry_interval` until the connect deadline. Callers only ever see the
//! final outcome.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::link::Link;
use super::{Transport, TransportError, TransportEvent};
use crate::constants::LOCAL_RETRY_INTERVAL;
use crate::framing::WireCodec;

/// Client transport over a Unix domain socket.
#[derive(Debug)]
pub struct LocalTransport {
    socket_path: PathBuf,
    retry_interval: Duration,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Option<UnboundedReceiver<TransportEvent>>,
    link: Option<Link>,
}

impl LocalTransport {
    /// A disconnected transport targeting `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            socket_path: socket_path.into(),
            retry_interval: LOCAL_RETRY_INTERVAL,
            events_tx,
            events_rx: Some(events_rx),
            link: None,
        }
    }

    /// Sets the delay between connection attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        self.link = None;

        let endpoint = self.endpoint();
        let path = self.socket_path.clone();
        let retry_interval = self.retry_interval;
        let mut last_error: Option<std::io::Error> = None;
        let mut attempts = 0u32;

        let attempt = async {
            loop {
                attempts += 1;
                match UnixStream::connect(&path).await {
                    Ok(stream) => return stream,
                    Err(e) => {
                        log::debug!(
                            "[Transport] {endpoint} attempt {attempts} failed: {e}; retrying in {retry_interval:?}"
                        );
                        last_error = Some(e);
                        tokio::time::sleep(retry_interval).await;
                    }
                }
            }
        };

        let Ok(stream) = tokio::time::timeout(timeout, attempt).await else {
            return Err(match last_error {
                Some(e) => TransportError::Connect {
                    endpoint,
                    reason: format!("{e} (gave up after {attempts} attempts in {timeout:?})"),
                },
                None => TransportError::Timeout { endpoint, timeout },
            });
        };

        let (reader, writer) = stream.into_split();
        self.link = Some(Link::spawn(
            "local",
            reader,
            writer,
            WireCodec::Ipc,
            self.events_tx.clone(),
        ));
        log::info!("[Transport] Connected to {endpoint} after {attempts} attempt(s)");
        Ok(())
    }

    fn send(&self, json: &str) -> Result<(), TransportError> {
        self.link
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(json)
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
    }

    fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(Link::is_connected)
    }

    fn take_events(&mut self) -> Option<UnboundedReceiver<TransportEvent>> {
        self.events_rx.take()
    }

    fn endpoint(&self) -> String {
        format!("unix:{}", self.socket_path.display())
    }
}
