//! TCP transport for receiver communication.
//!
//! This module provides [`TcpTransport`], which implements the [`Transport`]
//! trait over a telnet-style TCP socket, and [`TcpConnector`], which opens a
//! fresh [`TcpTransport`] for every request the command queue dispatches.
//!
//! Denon and Marantz receivers expose their control protocol on TCP port 23
//! and only accept one client at a time, so sockets are short-lived: opened
//! for a single command (or a query plus an optional follow-up) and closed
//! again.
//!
//! # Example
//!
//! ```no_run
//! use avrlib_transport::TcpTransport;
//! use avrlib_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> avrlib_core::Result<()> {
//! let mut transport = TcpTransport::connect("192.168.1.40:23").await?;
//!
//! // Query power state
//! transport.send(b"PW?\r").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use avrlib_core::error::{Error, Result};
use avrlib_core::transport::{Connector, Transport};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default connection timeout used by [`TcpTransport::connect`].
///
/// The command queue applies its own (shorter) connect timeout around
/// [`TcpConnector`], so this only matters for direct use.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport for receiver communication.
///
/// The connection is established eagerly via [`connect`](TcpTransport::connect)
/// or [`connect_with_timeout`](TcpTransport::connect_with_timeout).
#[derive(Debug)]
pub struct TcpTransport {
    /// The underlying TCP stream, `None` after `close()` is called.
    stream: Option<TcpStream>,
    /// The address string for logging/debugging.
    addr: String,
}

impl TcpTransport {
    /// Connect to a TCP endpoint using the default timeout.
    ///
    /// The `addr` parameter should be a `host:port` string, e.g.
    /// `"192.168.1.40:23"`.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect to a TCP endpoint with a specified timeout.
    ///
    /// Returns [`Error::ConnectTimeout`] if the connection is not
    /// established within `timeout`.
    pub async fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, Self::open(addr))
            .await
            .map_err(|_| {
                tracing::error!(addr = %addr, "TCP connection timed out");
                Error::ConnectTimeout
            })??;
        Ok(stream)
    }

    /// Open the socket without a deadline.
    async fn open(addr: &str) -> Result<Self> {
        tracing::debug!(addr = %addr, "Connecting to receiver");

        let stream = TcpStream::connect(addr).await.map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "TCP connection failed");
            map_connect_error(e, addr)
        })?;

        // Commands are a handful of bytes; don't let Nagle hold them back.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(
                addr = %addr,
                error = %e,
                "Failed to set TCP_NODELAY (continuing anyway)"
            );
        }

        tracing::debug!(addr = %addr, "TCP connection established");

        Ok(Self {
            stream: Some(stream),
            addr: addr.to_string(),
        })
    }

    /// Get the address string this transport was connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            addr = %self.addr,
            bytes = data.len(),
            data = ?String::from_utf8_lossy(data),
            "Sending data"
        );

        stream.write_all(data).await.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to send data");
            map_io_error(e)
        })?;

        stream.flush().await.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to flush TCP stream");
            map_io_error(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) => {
                // 0 bytes read means the peer has closed the connection.
                tracing::debug!(addr = %self.addr, "Peer closed connection (0 bytes read)");
                Err(Error::ConnectionLost)
            }
            Ok(Ok(n)) => {
                tracing::trace!(
                    addr = %self.addr,
                    bytes = n,
                    data = ?String::from_utf8_lossy(&buf[..n]),
                    "Received data"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(addr = %self.addr, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(addr = %self.addr, "Closing TCP connection");

            if let Err(e) = stream.shutdown().await {
                tracing::warn!(
                    addr = %self.addr,
                    error = %e,
                    "Failed to shutdown TCP stream (continuing anyway)"
                );
            }
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if self.stream.is_some() {
            tracing::debug!(addr = %self.addr, "TcpTransport dropped, closing connection");
        }
    }
}

/// [`Connector`] that opens a [`TcpTransport`] per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    /// Create a new TCP connector.
    pub fn new() -> Self {
        TcpConnector
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Transport>> {
        let transport = TcpTransport::open(addr).await?;
        Ok(Box::new(transport))
    }
}

/// Map a connection-time I/O error to the appropriate [`Error`] variant.
fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Error::Transport(format!("connection refused: {}", addr))
        }
        _ => Error::Io(e),
    }
}

/// Map a data-path I/O error to the appropriate [`Error`] variant.
fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}
