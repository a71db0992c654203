//! Byte stream providers.
//!
//! A session only needs something readable and writable. [`SocketFactory`]
//! is the seam for proxies and custom transports; [`TcpSocketFactory`] is
//! the plain TCP default.

use async_trait::async_trait;
use fynx_platform::{FynxError, FynxResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A bidirectional byte stream a session can run over.
pub trait SshStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> SshStream for T {}

/// Opens the byte stream to a server.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Connects to `host:port`, giving up after `timeout` when set.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> FynxResult<Box<dyn SshStream>>;
}

/// Direct TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory;

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> FynxResult<Box<dyn SshStream>> {
        let connect = TcpStream::connect((host, port));
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                FynxError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Connection timeout",
                ))
            })??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        debug!(host = %host, port, "TCP connection established");
        Ok(Box::new(stream))
    }
}
