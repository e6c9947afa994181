//! In-memory connector and transport for deterministic testing.
//!
//! [`MockConnector`] implements the [`Connector`] trait with a queue of
//! scripted connections. Each call to `connect()` consumes the next
//! [`ConnectionScript`] and hands back a [`MockTransport`] that checks
//! what is sent against the script and replays the scripted reply chunks,
//! each after its own delay.
//!
//! All delays go through `tokio::time`, so tests run with
//! `#[tokio::test(start_paused = true)]` exercise connect timeouts,
//! inactivity timeouts, coalescing windows and the reconnect guard
//! without waiting in real time.
//!
//! The connector also keeps a log of connects and closes, and the highest
//! number of simultaneously open transports, so tests can assert the
//! one-socket-per-device rule.
//!
//! # Example
//!
//! ```
//! use avrlib_test_harness::{ConnectionScript, MockConnector};
//! use std::time::Duration;
//!
//! let mock = MockConnector::new();
//! mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"PWON\r"));
//! mock.push(
//!     ConnectionScript::new()
//!         .expect(b"MV?\r")
//!         .reply(b"MV50\r")
//!         .reply_after(Duration::from_millis(30), b"MVMAX 98\r"),
//! );
//! mock.push(ConnectionScript::stall());
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use avrlib_core::error::{Error, Result};
use avrlib_core::transport::{Connector, Transport};

/// How a scripted connection attempt behaves.
#[derive(Debug, Clone)]
enum ConnectBehavior {
    /// Connect after the given delay.
    Accept(Duration),
    /// Fail immediately as if the port were closed.
    Refuse,
    /// Never complete; only a connect timeout gets the caller out.
    Stall,
}

/// One piece of a scripted reply.
#[derive(Debug, Clone)]
struct Chunk {
    /// Delay measured from the previous chunk (or from the send).
    delay: Duration,
    bytes: Vec<u8>,
}

/// A scripted request and the chunks sent back for it.
#[derive(Debug, Clone)]
struct Exchange {
    request: Vec<u8>,
    reply: Vec<Chunk>,
}

/// Script for a single connection handed out by [`MockConnector`].
#[derive(Debug, Clone)]
pub struct ConnectionScript {
    connect: ConnectBehavior,
    exchanges: Vec<Exchange>,
    /// The peer closes the socket once every scripted reply was read.
    close_when_done: bool,
}

impl ConnectionScript {
    /// A connection that is accepted immediately.
    pub fn new() -> Self {
        ConnectionScript {
            connect: ConnectBehavior::Accept(Duration::ZERO),
            exchanges: Vec::new(),
            close_when_done: false,
        }
    }

    /// A connection attempt that is refused.
    pub fn refuse() -> Self {
        ConnectionScript {
            connect: ConnectBehavior::Refuse,
            ..Self::new()
        }
    }

    /// A connection attempt that never completes.
    pub fn stall() -> Self {
        ConnectionScript {
            connect: ConnectBehavior::Stall,
            ..Self::new()
        }
    }

    /// Accept the connection only after `delay`.
    pub fn connect_after(mut self, delay: Duration) -> Self {
        self.connect = ConnectBehavior::Accept(delay);
        self
    }

    /// Expect the client to send exactly `request` next.
    pub fn expect(mut self, request: &[u8]) -> Self {
        self.exchanges.push(Exchange {
            request: request.to_vec(),
            reply: Vec::new(),
        });
        self
    }

    /// Reply to the latest expected request immediately.
    pub fn reply(self, bytes: &[u8]) -> Self {
        self.reply_after(Duration::ZERO, bytes)
    }

    /// Reply to the latest expected request after `delay`, measured from
    /// the previous reply chunk (or from the request).
    ///
    /// Calling this repeatedly splits one logical reply over several TCP
    /// segments.
    pub fn reply_after(mut self, delay: Duration, bytes: &[u8]) -> Self {
        if let Some(exchange) = self.exchanges.last_mut() {
            exchange.reply.push(Chunk {
                delay,
                bytes: bytes.to_vec(),
            });
        }
        self
    }

    /// Have the peer close the socket after the last scripted reply.
    pub fn then_close(mut self) -> Self {
        self.close_when_done = true;
        self
    }
}

impl Default for ConnectionScript {
    fn default() -> Self {
        Self::new()
    }
}

/// A connect or close observed by the [`MockConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// A transport was handed out.
    Connected(Instant),
    /// A transport was closed or dropped.
    Closed(Instant),
}

#[derive(Debug, Default)]
struct Shared {
    scripts: VecDeque<ConnectionScript>,
    open: usize,
    max_open: usize,
    events: Vec<SocketEvent>,
    sent: Vec<Vec<u8>>,
    addrs: Vec<String>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A scripted [`Connector`] for testing the command queue without a network.
///
/// Cloning is cheap and shares the script queue and the observation log, so
/// a test keeps one clone for assertions and hands another to the code
/// under test.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    shared: Arc<Mutex<Shared>>,
}

impl MockConnector {
    /// Create a connector with no scripted connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next connection attempt.
    pub fn push(&self, script: ConnectionScript) {
        lock(&self.shared).scripts.push_back(script);
    }

    /// Number of scripted connections not yet consumed.
    pub fn remaining_scripts(&self) -> usize {
        lock(&self.shared).scripts.len()
    }

    /// Number of transports currently open.
    pub fn open_connections(&self) -> usize {
        lock(&self.shared).open
    }

    /// The highest number of transports that were open at the same time.
    pub fn max_open_connections(&self) -> usize {
        lock(&self.shared).max_open
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        lock(&self.shared)
            .events
            .iter()
            .filter(|e| matches!(e, SocketEvent::Connected(_)))
            .count()
    }

    /// Chronological log of connects and closes.
    pub fn socket_events(&self) -> Vec<SocketEvent> {
        lock(&self.shared).events.clone()
    }

    /// Every chunk of bytes sent over any transport, in order.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).sent.clone()
    }

    /// Every chunk sent, decoded as text with the trailing CR stripped.
    pub fn sent_commands(&self) -> Vec<String> {
        lock(&self.shared)
            .sent
            .iter()
            .map(|b| {
                String::from_utf8_lossy(b)
                    .trim_end_matches('\r')
                    .to_string()
            })
            .collect()
    }

    /// Addresses passed to `connect()`, including refused attempts.
    pub fn connect_addrs(&self) -> Vec<String> {
        lock(&self.shared).addrs.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Transport>> {
        let script = {
            let mut shared = lock(&self.shared);
            shared.addrs.push(addr.to_string());
            shared.scripts.pop_front()
        };

        let Some(script) = script else {
            return Err(Error::Transport(format!(
                "no scripted connection left for {addr}"
            )));
        };

        match script.connect {
            ConnectBehavior::Refuse => {
                return Err(Error::Transport(format!("connection refused: {addr}")));
            }
            ConnectBehavior::Stall => {
                std::future::pending::<()>().await;
            }
            ConnectBehavior::Accept(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        {
            let mut shared = lock(&self.shared);
            shared.open += 1;
            shared.max_open = shared.max_open.max(shared.open);
            shared.events.push(SocketEvent::Connected(Instant::now()));
        }

        Ok(Box::new(MockTransport {
            shared: Arc::clone(&self.shared),
            exchanges: script.exchanges.into(),
            pending: VecDeque::new(),
            close_when_done: script.close_when_done,
            connected: true,
        }))
    }
}

/// Transport handed out by [`MockConnector`].
#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
    exchanges: VecDeque<Exchange>,
    /// Reply chunks of the current exchange not yet delivered.
    pending: VecDeque<Chunk>,
    close_when_done: bool,
    connected: bool,
}

impl MockTransport {
    fn mark_closed(&mut self) {
        if self.connected {
            self.connected = false;
            let mut shared = lock(&self.shared);
            shared.open = shared.open.saturating_sub(1);
            shared.events.push(SocketEvent::Closed(Instant::now()));
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        lock(&self.shared).sent.push(data.to_vec());

        match self.exchanges.pop_front() {
            Some(exchange) if exchange.request == data => {
                self.pending.extend(exchange.reply);
                Ok(())
            }
            Some(exchange) => Err(Error::Transport(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&exchange.request),
                String::from_utf8_lossy(data)
            ))),
            None => Err(Error::Transport(format!(
                "unexpected send data: {:?}",
                String::from_utf8_lossy(data)
            ))),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        let Some(chunk) = self.pending.front_mut() else {
            if self.close_when_done && self.exchanges.is_empty() {
                return Err(Error::ConnectionLost);
            }
            tokio::time::sleep(timeout).await;
            return Err(Error::Timeout);
        };

        if chunk.delay > timeout {
            tokio::time::sleep(timeout).await;
            chunk.delay -= timeout;
            return Err(Error::Timeout);
        }

        if !chunk.delay.is_zero() {
            tokio::time::sleep(chunk.delay).await;
            chunk.delay = Duration::ZERO;
        }

        let n = chunk.bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk.bytes[..n]);
        chunk.bytes.drain(..n);
        if chunk.bytes.is_empty() {
            self.pending.pop_front();
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.mark_closed();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.mark_closed();
    }
}
