//! Per-connection state for control-channel clients (server side).
//!
//! Each accepted connection gets a `ClientConn` that owns a read task and a
//! write task. The read task turns frames into [`ConnEvent`]s for the
//! server's dispatch loop; the write task drains a bounded queue.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender, UnboundedSender};
use tokio::task::JoinHandle;

use crate::constants::READ_BUFFER_SIZE;
use crate::framing::WireCodec;
use crate::protocol::Envelope;
use crate::transport::{Accepted, BoxReader, BoxWriter};

/// What a connection reports to the dispatch loop.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// One complete inbound frame.
    Frame {
        client_id: String,
        conn_seq: u64,
        text: String,
    },
    /// The connection ended (EOF, read or write error).
    Closed { client_id: String, conn_seq: u64 },
}

/// Server-side state for a single client.
pub(crate) struct ClientConn {
    client_id: String,
    /// Distinguishes this connection from a later one that reuses the id.
    conn_seq: u64,
    codec: WireCodec,
    outbound: Sender<Vec<u8>>,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("client_id", &self.client_id)
            .field("conn_seq", &self.conn_seq)
            .finish_non_exhaustive()
    }
}

impl ClientConn {
    /// Spawns the read and write tasks for an accepted connection.
    pub(crate) fn new(
        client_id: String,
        conn_seq: u64,
        accepted: Accepted,
        codec: WireCodec,
        queue_capacity: usize,
        conn_tx: UnboundedSender<ConnEvent>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel::<Vec<u8>>(queue_capacity.max(1));

        let read_handle = tokio::spawn(read_loop(
            client_id.clone(),
            conn_seq,
            accepted.reader,
            codec,
            conn_tx.clone(),
        ));
        let write_handle = tokio::spawn(write_loop(
            client_id.clone(),
            conn_seq,
            accepted.writer,
            outbound_rx,
            conn_tx,
        ));

        Self {
            client_id,
            conn_seq,
            codec,
            outbound,
            read_handle,
            write_handle,
        }
    }

    pub(crate) fn conn_seq(&self) -> u64 {
        self.conn_seq
    }

    /// Queues an envelope.
    pub(crate) fn send_envelope(&self, envelope: &Envelope) -> bool {
        self.send_json(&envelope.encode())
    }

    /// Queues pre-serialized envelope JSON.
    ///
    /// Returns `false` if the message was dropped: the queue is full (slow
    /// reader) or the write task is gone.
    pub(crate) fn send_json(&self, json: &str) -> bool {
        match self.outbound.try_send(self.codec.encode(json)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "[Server] Outbound queue full for {}, dropping message",
                    self.client_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Aborts both tasks. Dropping the writer closes the socket.
    pub(crate) fn disconnect(self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

async fn read_loop(
    client_id: String,
    conn_seq: u64,
    mut reader: BoxReader,
    codec: WireCodec,
    conn_tx: UnboundedSender<ConnEvent>,
) {
    let mut decoder = codec.decoder();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Server] Client disconnected: {client_id}");
                break;
            }
            Ok(n) => {
                for frame in codec.decode(&mut decoder, &buf[..n]) {
                    match frame {
                        Ok(text) => {
                            let event = ConnEvent::Frame {
                                client_id: client_id.clone(),
                                conn_seq,
                                text,
                            };
                            if conn_tx.send(event).is_err() {
                                return; // server shut down
                            }
                        }
                        Err(e) => {
                            log::warn!("[Server] Dropping bad frame from {client_id}: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("[Server] Read error for {client_id}: {e}");
                break;
            }
        }
    }

    let _ = conn_tx.send(ConnEvent::Closed {
        client_id,
        conn_seq,
    });
}

async fn write_loop(
    client_id: String,
    conn_seq: u64,
    mut writer: BoxWriter,
    mut outbound_rx: Receiver<Vec<u8>>,
    conn_tx: UnboundedSender<ConnEvent>,
) {
    while let Some(data) = outbound_rx.recv().await {
        let result = match writer.write_all(&data).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("[Server] Write error for {client_id}: {e}");
            let _ = conn_tx.send(ConnEvent::Closed {
                client_id,
                conn_seq,
            });
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn accepted(stream: tokio::io::DuplexStream) -> Accepted {
        let (reader, writer) = tokio::io::split(stream);
        Accepted {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            peer: "duplex".to_string(),
        }
    }

    #[tokio::test]
    async fn test_frames_and_close_reported_with_identity() {
        let (server_side, mut peer) = tokio::io::duplex(1024);
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let conn = ClientConn::new(
            "abc".into(),
            7,
            accepted(server_side),
            WireCodec::Lines,
            4,
            conn_tx,
        );

        peer.write_all(b"{\"a\":1}\nnot json but a frame\n").await.unwrap();
        for expected in ["{\"a\":1}", "not json but a frame"] {
            match timeout(Duration::from_secs(2), conn_rx.recv()).await.unwrap() {
                Some(ConnEvent::Frame {
                    client_id,
                    conn_seq,
                    text,
                }) => {
                    assert_eq!((client_id.as_str(), conn_seq), ("abc", 7));
                    assert_eq!(text, expected);
                }
                other => panic!("Expected Frame, got: {other:?}"),
            }
        }

        drop(peer);
        match timeout(Duration::from_secs(2), conn_rx.recv()).await.unwrap() {
            Some(ConnEvent::Closed { conn_seq: 7, .. }) => {}
            other => panic!("Expected Closed, got: {other:?}"),
        }
        conn.disconnect();
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        // Tiny duplex buffer and nobody reading: the writer stalls.
        let (server_side, _peer) = tokio::io::duplex(8);
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let conn = ClientConn::new(
            "slow".into(),
            1,
            accepted(server_side),
            WireCodec::Lines,
            2,
            conn_tx,
        );

        let payload = "x".repeat(64);
        let results: Vec<bool> = (0..16).map(|_| conn.send_json(&payload)).collect();
        assert!(results.iter().any(|ok| !ok), "queue never reported full");
        conn.disconnect();
    }
}
