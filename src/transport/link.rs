//! Read/write task pair shared by the client transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::{TransportError, TransportEvent};
use crate::constants::READ_BUFFER_SIZE;
use crate::framing::WireCodec;

/// Per-connection flags shared between the tasks and the owning transport.
#[derive(Debug)]
struct LinkState {
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LinkState {
    /// Marks the link down and emits `Close` unless already emitted.
    fn close(&self, events: &UnboundedSender<TransportEvent>) {
        self.connected.store(false, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Close);
        }
    }
}

/// One live connection: a framed reader task and a writer task.
pub(super) struct Link {
    label: &'static str,
    codec: WireCodec,
    outbound: UnboundedSender<Vec<u8>>,
    events: UnboundedSender<TransportEvent>,
    state: Arc<LinkState>,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("label", &self.label)
            .field("codec", &self.codec)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Spawns the reader and writer tasks over an already-open stream.
    pub(super) fn spawn<R, W>(
        label: &'static str,
        reader: R,
        writer: W,
        codec: WireCodec,
        events: UnboundedSender<TransportEvent>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let state = Arc::new(LinkState {
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let read_handle = tokio::spawn(read_loop(
            label,
            reader,
            codec,
            events.clone(),
            Arc::clone(&state),
        ));
        let write_handle = tokio::spawn(write_loop(label, writer, outbound_rx, events.clone()));

        Self {
            label,
            codec,
            outbound,
            events,
            state,
            read_handle,
            write_handle,
        }
    }

    pub(super) fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub(super) fn send(&self, json: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(self.codec.encode(json))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Tears the connection down and emits `Close` if still pending.
    pub(super) fn shutdown(self) {
        log::debug!("[Transport] {} link shutting down", self.label);
        self.read_handle.abort();
        self.write_handle.abort();
        self.state.close(&self.events);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

async fn read_loop<R>(
    label: &'static str,
    mut reader: R,
    codec: WireCodec,
    events: UnboundedSender<TransportEvent>,
    state: Arc<LinkState>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = codec.decoder();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Transport] {label} connection closed by peer");
                break;
            }
            Ok(n) => {
                for frame in codec.decode(&mut decoder, &buf[..n]) {
                    match frame {
                        Ok(text) => {
                            if events.send(TransportEvent::Data(text)).is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("[Transport] {label} dropped frame: {e}"),
                    }
                }
            }
            Err(e) => {
                log::error!("[Transport] {label} read error: {e}");
                let _ = events.send(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }

    state.close(&events);
}

async fn write_loop<W>(
    label: &'static str,
    mut writer: W,
    mut outbound: UnboundedReceiver<Vec<u8>>,
    events: UnboundedSender<TransportEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            log::error!("[Transport] {label} write error: {e}");
            let _ = events.send(TransportEvent::Error(e.to_string()));
            break;
        }
        if let Err(e) = writer.flush().await {
            log::error!("[Transport] {label} flush error: {e}");
            let _ = events.send(TransportEvent::Error(e.to_string()));
            break;
        }
    }
    let _ = writer.shutdown().await;
}
