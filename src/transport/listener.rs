//! Server-side listener over either transport.

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::pin::Pin;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use crate::config::TransportConfig;
#[cfg(unix)]
use crate::constants::MAX_SOCKET_PATH_LEN;
use crate::framing::WireCodec;

/// Boxed read half of an accepted connection.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
/// Boxed write half of an accepted connection.
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Where a listener is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP address (with the real port when bound to port 0).
    Tcp(SocketAddr),
    /// Unix socket file.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    /// The equivalent client-side transport config.
    pub fn transport_config(&self) -> TransportConfig {
        match self {
            Self::Tcp(addr) => TransportConfig::tcp(addr.ip().to_string(), addr.port()),
            #[cfg(unix)]
            Self::Unix(path) => TransportConfig::local(path.clone()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// An accepted connection, split and ready for the server's tasks.
pub struct Accepted {
    /// Inbound bytes.
    pub reader: BoxReader,
    /// Outbound bytes.
    pub writer: BoxWriter,
    /// Peer description for logs.
    pub peer: String,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// A bound listener.
#[derive(Debug)]
pub enum Listener {
    /// TCP, newline framing.
    Tcp(TcpListener),
    /// Unix socket, node-ipc framing.
    #[cfg(unix)]
    Unix {
        /// The listener.
        listener: UnixListener,
        /// Socket file, removed on cleanup.
        path: PathBuf,
    },
}

impl Listener {
    /// Binds according to `config`.
    ///
    /// For a local socket: rejects over-long paths, creates the parent
    /// directory, removes a stale socket file and restricts the new one to
    /// the owner (0600).
    pub async fn bind(config: &TransportConfig) -> Result<Self> {
        match config {
            TransportConfig::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to bind tcp://{host}:{port}"))?;
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            TransportConfig::Local { socket_path } => Self::bind_unix(socket_path),
            #[cfg(not(unix))]
            TransportConfig::Local { .. } => {
                anyhow::bail!("local socket transport is not supported on this platform")
            }
        }
    }

    #[cfg(unix)]
    fn bind_unix(socket_path: &Path) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH_LEN {
            anyhow::bail!(
                "Socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH_LEN - 1,
                socket_path.display()
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(socket_path).with_context(|| {
                format!("Failed to remove stale socket: {}", socket_path.display())
            })?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        Ok(Self::Unix {
            listener,
            path: socket_path.to_path_buf(),
        })
    }

    /// Waits for the next connection.
    pub async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("[Server] set_nodelay failed for {addr}: {e}");
                }
                let (reader, writer) = stream.into_split();
                Ok(Accepted {
                    reader: Box::pin(reader),
                    writer: Box::pin(writer),
                    peer: addr.to_string(),
                })
            }
            #[cfg(unix)]
            Self::Unix { listener, path } => {
                let (stream, _addr) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(Accepted {
                    reader: Box::pin(reader),
                    writer: Box::pin(writer),
                    peer: path.display().to_string(),
                })
            }
        }
    }

    /// Framing used on accepted connections.
    pub fn codec(&self) -> WireCodec {
        match self {
            Self::Tcp(_) => WireCodec::Lines,
            #[cfg(unix)]
            Self::Unix { .. } => WireCodec::Ipc,
        }
    }

    /// Bound endpoint.
    pub fn endpoint(&self) -> Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Removes the socket file, if any.
    pub fn cleanup(&self) {
        #[cfg(unix)]
        if let Self::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("[Server] Socket cleanup for {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_ephemeral_port() {
        let listener = Listener::bind(&TransportConfig::tcp("127.0.0.1", 0)).await.unwrap();
        let Endpoint::Tcp(addr) = listener.endpoint().unwrap() else {
            panic!("expected tcp endpoint");
        };
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.codec(), WireCodec::Lines);
        assert_eq!(
            listener.endpoint().unwrap().transport_config(),
            TransportConfig::tcp("127.0.0.1", addr.port())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_replaces_stale_file_and_cleans_up() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("run/engine.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let listener = Listener::bind(&TransportConfig::local(&path)).await.unwrap();
        assert_eq!(listener.codec(), WireCodec::Ipc);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        listener.cleanup();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_path_too_long() {
        let long = format!("/tmp/{}.sock", "x".repeat(MAX_SOCKET_PATH_LEN));
        let err = Listener::bind(&TransportConfig::local(long)).await.unwrap_err();
        assert!(err.to_string().contains("too long"), "got: {err}");
    }
}
