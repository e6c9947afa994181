//! Per-request connection state machine.
//!
//! Every queued request gets its own short-lived socket:
//!
//! ```text
//! Idle -> Connecting -> Sending -> (write) ----------------------> Closing -> Idle
//!                               -> (read)  AwaitingResponse -> Held -> Closing -> Idle
//! ```
//!
//! A write-close request closes the socket as soon as the command has been
//! flushed. A read-hold request waits for the first reply bytes (bounded by
//! the inactivity timeout), keeps collecting until the line has been quiet
//! for the coalescing delay, and hands the text to the caller together with
//! a [`Session`] that keeps the socket open for follow-up commands.
//!
//! The `Closing -> Idle` edge always waits the reconnect guard: receivers
//! refuse a new telnet connection while the previous one is still settling
//! on their side. The dispatch loop treats the slot as busy until the
//! connection task has finished, guard included.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use avrlib_core::error::{Error, Result};
use avrlib_core::transport::{Connector, Transport};

use crate::io::{QueueConfig, Request};
use crate::protocol::{self, ResponseMatcher};

/// Maximum reply size before coalescing stops early.
/// Status replies are a few dozen bytes; 8192 is generous headroom.
const MAX_BUF: usize = 8192;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// State of a device's connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket; the next queued request may start.
    #[default]
    Idle,
    /// TCP connect in progress.
    Connecting,
    /// Connected, sending the command.
    Sending,
    /// Read request sent, waiting for (more) reply bytes.
    AwaitingResponse,
    /// Reply delivered; the caller holds the socket through a [`Session`].
    Held,
    /// Socket closed, waiting out the reconnect guard.
    Closing,
}

impl ConnectionState {
    /// `true` if a socket is open or about to be.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Sending => "sending",
            ConnectionState::AwaitingResponse => "awaiting-response",
            ConnectionState::Held => "held",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Reply to a read-hold request.
///
/// `text` is the coalesced reply with terminators intact; it may contain
/// several messages, e.g. `"SIBD\rSVOFF\r"`. The socket stays open until
/// `session` is closed or dropped, or until it idles past the inactivity
/// timeout.
#[derive(Debug)]
pub struct ReadReply {
    /// Coalesced reply text.
    pub text: String,
    /// Handle on the still-open connection.
    pub session: Session,
}

impl ReadReply {
    /// First message of the reply accepted by `matcher`.
    pub fn extract(&self, matcher: &ResponseMatcher) -> Option<&str> {
        protocol::extract_by_prefix(&self.text, matcher)
    }
}

/// Operations the holder of a [`Session`] can perform.
#[derive(Debug)]
enum SessionOp {
    Write {
        command: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ReadMore {
        reply: oneshot::Sender<Result<String>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A connection kept open after a read-hold reply.
///
/// While a session exists the device's queue is blocked, so hold it only
/// for an immediate follow-up (e.g. read the mute state, then flip it).
/// Dropping the session closes the socket.
#[derive(Debug)]
pub struct Session {
    seq: u64,
    ops: mpsc::Sender<SessionOp>,
}

impl Session {
    /// Sequence id of the request that opened this session.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Send a follow-up command on the held socket.
    pub async fn write(&self, command: &str) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(SessionOp::Write {
                command: command.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Wait for the next coalesced reply on the held socket.
    pub async fn read_more(&self) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(SessionOp::ReadMore { reply: reply_tx })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Close the socket and wait until it is shut down.
    ///
    /// The device's queue resumes after the reconnect guard.
    pub async fn close(self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .ops
            .send(SessionOp::Close { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Drives one request at a time through its socket lifecycle.
///
/// Shared between the dispatch loop and the connection task it spawns;
/// only one connection task runs per device at any time.
pub(crate) struct Connection {
    addr: String,
    connector: Arc<dyn Connector>,
    config: QueueConfig,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        addr: String,
        connector: Arc<dyn Connector>,
        config: QueueConfig,
        state: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
    ) -> Self {
        Connection {
            addr,
            connector,
            config,
            state,
            cancel,
        }
    }

    /// Run `request` to completion, then wait out the reconnect guard.
    ///
    /// On teardown the request is abandoned where it stands: its reply
    /// sender and socket are dropped and the caller is never answered.
    pub(crate) async fn run(self: Arc<Self>, request: Request) {
        let seq = request.seq();

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                debug!(seq, addr = %self.addr, "request abandoned by teardown");
                self.set_state(ConnectionState::Idle);
                return;
            }

            _ = self.drive(request) => {}
        }

        self.set_state(ConnectionState::Closing);

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                self.set_state(ConnectionState::Idle);
                return;
            }

            _ = tokio::time::sleep(self.config.reconnect_guard) => {}
        }

        self.set_state(ConnectionState::Idle);
    }

    async fn drive(&self, request: Request) {
        match request {
            Request::Write {
                seq,
                command,
                reply,
            } => {
                let result = self.write_close(seq, &command).await;
                if let Err(e) = &result {
                    warn!(seq, command = %command, error = %e, "write request failed");
                }
                if reply.send(result).is_err() {
                    trace!(seq, "write caller no longer waiting");
                }
            }
            Request::Read {
                seq,
                command,
                reply,
            } => self.read_hold(seq, &command, reply).await,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(addr = %self.addr, from = %prev, to = %next, "connection state");
        }
    }

    async fn open(&self, seq: u64) -> Result<Box<dyn Transport>> {
        self.set_state(ConnectionState::Connecting);

        match tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&self.addr))
            .await
        {
            Ok(Ok(transport)) => {
                info!(seq, addr = %self.addr, "connected to receiver");
                Ok(transport)
            }
            Ok(Err(e)) => {
                warn!(seq, addr = %self.addr, error = %e, "connect failed");
                Err(e)
            }
            Err(_) => {
                warn!(
                    seq,
                    addr = %self.addr,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "connect timed out; is Network Control enabled on the receiver?"
                );
                Err(Error::ConnectTimeout)
            }
        }
    }

    async fn close_transport(&self, seq: u64, mut transport: Box<dyn Transport>) {
        self.set_state(ConnectionState::Closing);
        if let Err(e) = transport.close().await {
            debug!(seq, error = %e, "error closing socket");
        }
        info!(seq, addr = %self.addr, "socket closed");
    }

    async fn write_close(&self, seq: u64, command: &str) -> Result<()> {
        let mut transport = self.open(seq).await?;

        self.set_state(ConnectionState::Sending);
        debug!(seq, command, "sending write-close command");
        let sent = transport.send(&protocol::encode_command(command)).await;

        self.close_transport(seq, transport).await;
        sent
    }

    async fn read_hold(
        &self,
        seq: u64,
        command: &str,
        reply: oneshot::Sender<Result<ReadReply>>,
    ) {
        let mut transport = match self.open(seq).await {
            Ok(transport) => transport,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        self.set_state(ConnectionState::Sending);
        debug!(seq, command, "sending read command");
        if let Err(e) = transport.send(&protocol::encode_command(command)).await {
            warn!(seq, command, error = %e, "read request failed");
            self.close_transport(seq, transport).await;
            let _ = reply.send(Err(e));
            return;
        }

        let text = match self.read_reply(seq, &mut *transport).await {
            Ok(text) => text,
            Err(e) => {
                warn!(seq, command, error = %e, "read request failed");
                self.close_transport(seq, transport).await;
                let _ = reply.send(Err(e));
                return;
            }
        };

        let (ops_tx, ops_rx) = mpsc::channel(4);
        self.set_state(ConnectionState::Held);
        let session = Session { seq, ops: ops_tx };

        if reply.send(Ok(ReadReply { text, session })).is_err() {
            debug!(seq, "read caller went away, releasing socket");
            self.close_transport(seq, transport).await;
            return;
        }

        self.hold(seq, transport, ops_rx).await;
    }

    /// Wait for a reply, then coalesce until the line goes quiet.
    ///
    /// Replies starting with the error sentinel become
    /// [`Error::DeviceReported`] carrying the raw text.
    async fn read_reply(&self, seq: u64, transport: &mut dyn Transport) -> Result<String> {
        self.set_state(ConnectionState::AwaitingResponse);

        let mut buffer = String::new();
        let mut chunk = [0u8; 256];

        let n = match transport
            .receive(&mut chunk, self.config.inactivity_timeout)
            .await
        {
            Ok(n) => n,
            Err(Error::Timeout) => return Err(Error::InactivityTimeout),
            Err(e) => return Err(e),
        };
        protocol::accumulate(&mut buffer, &chunk[..n]);

        loop {
            match transport
                .receive(&mut chunk, self.config.coalesce_delay)
                .await
            {
                Ok(n) => {
                    protocol::accumulate(&mut buffer, &chunk[..n]);
                    if buffer.len() > MAX_BUF {
                        warn!(seq, len = buffer.len(), "reply too long, stop coalescing");
                        break;
                    }
                }
                Err(Error::Timeout) => break,
                Err(e) => {
                    debug!(seq, error = %e, "socket ended while coalescing reply");
                    break;
                }
            }
        }

        trace!(seq, reply = ?buffer, "coalesced reply");

        if protocol::is_error_reply(&buffer) {
            let raw = buffer.trim_end_matches(['\r', '\n']).to_string();
            warn!(seq, reply = %raw, "receiver returned an error message");
            return Err(Error::DeviceReported(raw));
        }

        Ok(buffer)
    }

    /// Serve session operations until released, idle, or failed.
    async fn hold(
        &self,
        seq: u64,
        mut transport: Box<dyn Transport>,
        mut ops: mpsc::Receiver<SessionOp>,
    ) {
        loop {
            let op = match tokio::time::timeout(self.config.inactivity_timeout, ops.recv()).await
            {
                Ok(Some(op)) => op,
                Ok(None) => {
                    debug!(seq, "session released");
                    break;
                }
                Err(_) => {
                    warn!(seq, "held socket idle past inactivity timeout, closing");
                    break;
                }
            };

            match op {
                SessionOp::Write { command, reply } => {
                    debug!(seq, command = %command, "session write");
                    let result = transport.send(&protocol::encode_command(&command)).await;
                    let failed = result.is_err();
                    let _ = reply.send(result);
                    if failed {
                        break;
                    }
                }
                SessionOp::ReadMore { reply } => {
                    let result = self.read_reply(seq, &mut *transport).await;
                    let dead = matches!(&result, Err(e) if e.is_transport());
                    let _ = reply.send(result);
                    if dead {
                        debug!(seq, "held socket failed, releasing");
                        break;
                    }
                    self.set_state(ConnectionState::Held);
                }
                SessionOp::Close { reply } => {
                    self.close_transport(seq, transport).await;
                    let _ = reply.send(());
                    return;
                }
            }
        }

        self.close_transport(seq, transport).await;
    }
}
