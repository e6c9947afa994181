//! Mock TCP server for protocol-level testing.
//!
//! [`MockTcpServer`] is a real localhost listener pre-loaded with a
//! sequence of scripted connections. The command queue opens a fresh
//! socket per request, so each script describes one accepted connection:
//! the requests the client is expected to send on it and the bytes sent
//! back for each. After its last exchange the server waits for the client
//! to close before accepting the next connection, which also lets tests
//! verify that connections never overlap.
//!
//! # Example
//!
//! ```
//! use avrlib_test_harness::MockTcpServer;
//!
//! # async fn example() -> avrlib_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//!
//! // First connection: a power query.
//! server.expect_connection(&[(b"PW?\r", b"PWON\r")]);
//! // Second connection: a fire-and-forget mute command.
//! server.expect_connection(&[(b"MUON\r", b"")]);
//!
//! let addr = server.addr().to_string();
//! server.start();
//! // ... drive a receiver at `addr` ...
//! server.wait().await.map_err(avrlib_core::Error::Transport)?;
//! # Ok(())
//! # }
//! ```

use avrlib_core::error::{Error, Result};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A pre-loaded request/response pair for one connection.
#[derive(Debug, Clone)]
struct TcpExpectation {
    /// The exact bytes we expect the client to send.
    request: Vec<u8>,
    /// The bytes to send back when the matching request is received.
    response: Vec<u8>,
}

/// A mock TCP server serving a scripted sequence of connections.
///
/// The server listens on a random available port on localhost. Once
/// [`start`](MockTcpServer::start) is called, it accepts one connection per
/// script, in order. If the client sends data that does not match the next
/// expectation, the server task ends with an error describing the mismatch.
pub struct MockTcpServer {
    /// The address the server is listening on (e.g., "127.0.0.1:54321").
    addr: String,
    /// Listener, moved into the server task on start.
    listener: Option<TcpListener>,
    /// One entry per expected connection.
    connections: VecDeque<Vec<TcpExpectation>>,
    /// Handle to the server task once started.
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockTcpServer {
    /// Create a new mock TCP server listening on a random port.
    ///
    /// Connections queue in the listen backlog until
    /// [`start`](MockTcpServer::start) is called, so scripts can be loaded
    /// after the address was handed out.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {}", e)))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();

        Ok(Self {
            addr,
            listener: Some(listener),
            connections: VecDeque::new(),
            server_handle: None,
        })
    }

    /// Script the next accepted connection.
    ///
    /// Each pair is `(request, response)`; an empty response means the
    /// server reads the request and sends nothing back.
    pub fn expect_connection(&mut self, exchanges: &[(&[u8], &[u8])]) {
        self.connections.push_back(
            exchanges
                .iter()
                .map(|(request, response)| TcpExpectation {
                    request: request.to_vec(),
                    response: response.to_vec(),
                })
                .collect(),
        );
    }

    /// The address the server is listening on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Port part of [`addr`](MockTcpServer::addr).
    pub fn port(&self) -> u16 {
        self.addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    /// Start serving the scripted connections in a background task.
    ///
    /// Call [`wait`](MockTcpServer::wait) to block until every script has
    /// been played and check for errors.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let connections: Vec<Vec<TcpExpectation>> = self.connections.drain(..).collect();

        let handle = tokio::spawn(async move {
            for (conn, expectations) in connections.iter().enumerate() {
                let (mut stream, peer) = listener
                    .accept()
                    .await
                    .map_err(|e| format!("connection {}: accept failed: {}", conn, e))?;
                tracing::debug!(conn, %peer, "mock server accepted connection");

                serve_script(&mut stream, conn, expectations).await?;

                // Hold the connection until the client releases it.
                let mut rest = [0u8; 64];
                loop {
                    match stream.read(&mut rest).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            return Err(format!(
                                "connection {}: unexpected trailing data {:02X?}",
                                conn,
                                &rest[..n]
                            ));
                        }
                    }
                }
            }
            Ok(())
        });

        self.server_handle = Some(handle);
    }

    /// Wait for the server task to complete and return any errors.
    ///
    /// Call this after the client has finished its interactions to verify
    /// that all expectations were met.
    pub async fn wait(self) -> std::result::Result<(), String> {
        if let Some(handle) = self.server_handle {
            handle
                .await
                .map_err(|e| format!("server task panicked: {}", e))?
        } else {
            Ok(())
        }
    }
}

async fn serve_script(
    stream: &mut TcpStream,
    conn: usize,
    expectations: &[TcpExpectation],
) -> std::result::Result<(), String> {
    for (i, expectation) in expectations.iter().enumerate() {
        let mut buf = vec![0u8; expectation.request.len()];
        let mut total_read = 0;

        // Read exactly the expected number of bytes
        while total_read < expectation.request.len() {
            let n = stream
                .read(&mut buf[total_read..])
                .await
                .map_err(|e| format!("connection {} expectation {}: read error: {}", conn, i, e))?;
            if n == 0 {
                return Err(format!(
                    "connection {} expectation {}: client disconnected after {} bytes (expected {})",
                    conn,
                    i,
                    total_read,
                    expectation.request.len()
                ));
            }
            total_read += n;
        }

        if buf != expectation.request {
            return Err(format!(
                "connection {} expectation {}: request mismatch: expected {:?}, got {:?}",
                conn,
                i,
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(&buf)
            ));
        }

        if !expectation.response.is_empty() {
            stream
                .write_all(&expectation.response)
                .await
                .map_err(|e| format!("connection {} expectation {}: write error: {}", conn, i, e))?;
            stream
                .flush()
                .await
                .map_err(|e| format!("connection {} expectation {}: flush error: {}", conn, i, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(addr: &str, request: &[u8], reply_len: usize) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut buf = vec![0u8; reply_len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn serves_connections_in_order() {
        let mut server = MockTcpServer::new().await.unwrap();
        server.expect_connection(&[(b"PW?\r", b"PWON\r")]);
        server.expect_connection(&[(b"MU?\r", b"MUOFF\r")]);
        let addr = server.addr().to_string();
        server.start();

        assert_eq!(roundtrip(&addr, b"PW?\r", 5).await, b"PWON\r");
        assert_eq!(roundtrip(&addr, b"MU?\r", 6).await, b"MUOFF\r");

        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn write_only_exchange() {
        let mut server = MockTcpServer::new().await.unwrap();
        server.expect_connection(&[(b"MUON\r", b"")]);
        let addr = server.addr().to_string();
        server.start();

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        stream.write_all(b"MUON\r").await.unwrap();
        drop(stream);

        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn mismatch_is_reported() {
        let mut server = MockTcpServer::new().await.unwrap();
        server.expect_connection(&[(b"PW?\r", b"PWON\r")]);
        let addr = server.addr().to_string();
        server.start();

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        stream.write_all(b"MV?\r").await.unwrap();

        let err = server.wait().await.unwrap_err();
        assert!(err.contains("request mismatch"), "got: {err}");
    }

    #[tokio::test]
    async fn port_matches_addr() {
        let server = MockTcpServer::new().await.unwrap();
        assert!(server.addr().ends_with(&format!(":{}", server.port())));
        assert_ne!(server.port(), 0);
    }
}
