//! Raw TCP transport with newline framing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::link::Link;
use super::{Transport, TransportError, TransportEvent};
use crate::framing::WireCodec;

/// Client transport over `host:port`.
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Option<UnboundedReceiver<TransportEvent>>,
    link: Option<Link>,
}

impl TcpTransport {
    /// A disconnected transport targeting `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            host: host.into(),
            port,
            events_tx,
            events_rx: Some(events_rx),
            link: None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        // A previous connection that the peer closed; its Close was already sent.
        self.link = None;

        let endpoint = self.endpoint();
        log::info!("[Transport] Connecting to {endpoint}");
        let stream = match tokio::time::timeout(
            timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    endpoint,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(TransportError::Timeout { endpoint, timeout }),
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Transport] set_nodelay failed: {e}");
        }

        let (reader, writer) = stream.into_split();
        self.link = Some(Link::spawn(
            "tcp",
            reader,
            writer,
            WireCodec::Lines,
            self.events_tx.clone(),
        ));
        log::info!("[Transport] Connected to {endpoint}");
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
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let transport = TcpTransport::new("127.0.0.1", 1);
        assert_eq!(transport.send("{}"), Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody is listening on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut transport = TcpTransport::new("127.0.0.1", port);
        let err = transport.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }), "got {err:?}");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_round_trip_and_single_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::new("127.0.0.1", port);
        let mut events = transport.take_events().unwrap();
        assert!(transport.take_events().is_none());

        let (connect, accept) = tokio::join!(
            transport.connect(Duration::from_secs(2)),
            listener.accept()
        );
        connect.unwrap();
        let (mut peer, _) = accept.unwrap();
        assert!(transport.is_connected());

        transport.send("{\"x\":1}").unwrap();
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"{\"x\":1}\n");

        peer.write_all(b"{\"y\":2}\n{\"z\"").await.unwrap();
        peer.write_all(b":3}\n").await.unwrap();
        let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(first, Some(TransportEvent::Data("{\"y\":2}".into())));
        assert_eq!(second, Some(TransportEvent::Data("{\"z\":3}".into())));

        transport.disconnect().await;
        transport.disconnect().await;
        let close = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(close, Some(TransportEvent::Close));
        let extra = timeout(Duration::from_millis(100), events.recv()).await;
        assert!(extra.is_err(), "second Close emitted: {extra:?}");
    }
}
