//! Per-device command queue and dispatch loop.
//!
//! One tokio task per device owns the backlog of pending requests and the
//! device's single connection slot. Callers enqueue requests over an mpsc
//! channel; each request carries a oneshot reply sender. The loop sleeps
//! while there is nothing to do, and while work is pending it ticks at a
//! fixed interval: on each tick, if the slot is free, it pops the head of
//! the backlog and spawns a connection task for it. The slot stays busy
//! until that task has closed its socket and waited out the reconnect
//! guard, so a device never has two sockets open.
//!
//! Requests complete in submission order. There is no priority, no
//! cancellation of individual requests and no automatic retry; retries
//! are the status poller's business.
//!
//! Teardown (explicit [`DeviceIo::shutdown`] or dropping the handle)
//! cancels the loop and any in-flight connection. Queued and in-flight
//! requests are dropped without being answered; their callers observe
//! [`Error::DeviceRemoved`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use avrlib_core::error::{Error, Result};
use avrlib_core::transport::Connector;
use avrlib_core::types::{DeviceSettings, RequestMode};

use crate::connection::{Connection, ConnectionState, ReadReply};
use crate::protocol::ResponseMatcher;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Timing configuration for a device's command queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a TCP connect may take (default 1s).
    pub connect_timeout: Duration,
    /// How long a connection may stay silent while a reply is awaited or a
    /// session is held (default 5s).
    pub inactivity_timeout: Duration,
    /// Quiet gap that ends a multi-segment reply (default 100ms).
    pub coalesce_delay: Duration,
    /// Settling time after a socket closes before the next connect
    /// (default 100ms).
    pub reconnect_guard: Duration,
    /// Dispatch loop tick while work is pending (default 50ms).
    pub tick_interval: Duration,
    /// Capacity of the request channel.
    pub channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            connect_timeout: Duration::from_secs(1),
            inactivity_timeout: Duration::from_secs(5),
            coalesce_delay: Duration::from_millis(100),
            reconnect_guard: Duration::from_millis(100),
            tick_interval: Duration::from_millis(50),
            channel_capacity: 32,
        }
    }
}

/// A request sent from callers to the dispatch loop.
#[derive(Debug)]
pub enum Request {
    /// Send the command and close the socket once flushed.
    Write {
        seq: u64,
        command: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Send the command, return the coalesced reply, keep the socket open.
    Read {
        seq: u64,
        command: String,
        reply: oneshot::Sender<Result<ReadReply>>,
    },
}

impl Request {
    /// Sequence id, for log correlation only.
    pub fn seq(&self) -> u64 {
        match self {
            Request::Write { seq, .. } | Request::Read { seq, .. } => *seq,
        }
    }

    /// The command text, without terminator.
    pub fn command(&self) -> &str {
        match self {
            Request::Write { command, .. } | Request::Read { command, .. } => command,
        }
    }

    /// How the request uses its connection.
    pub fn mode(&self) -> RequestMode {
        match self {
            Request::Write { .. } => RequestMode::WriteClose,
            Request::Read { .. } => RequestMode::ReadHold,
        }
    }

    /// A read whose caller is no longer waiting has nowhere to deliver
    /// its reply and must not open a socket.
    fn is_orphaned_read(&self) -> bool {
        match self {
            Request::Read { reply, .. } => reply.is_closed(),
            Request::Write { .. } => false,
        }
    }
}

/// Handle to a device's dispatch loop.
///
/// Dropping the handle tears the device down.
pub struct DeviceIo {
    addr: String,
    tx: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    next_seq: AtomicU64,
    task: Option<JoinHandle<()>>,
}

impl DeviceIo {
    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn enqueue(&self, request: Request) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::DeviceRemoved);
        }
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::DeviceRemoved)
    }

    /// Queue a write-close request and wait for the command to be sent.
    pub async fn write(&self, command: &str) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Request::Write {
            seq: self.next_seq(),
            command: command.to_string(),
            reply: reply_tx,
        })
        .await?;

        reply_rx.await.map_err(|_| Error::DeviceRemoved)?
    }

    /// Queue a read-hold request and wait for the coalesced reply.
    ///
    /// The returned [`ReadReply`] holds the socket open; close or drop its
    /// session promptly, the device's queue is blocked until then.
    pub async fn read(&self, command: &str) -> Result<ReadReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Request::Read {
            seq: self.next_seq(),
            command: command.to_string(),
            reply: reply_tx,
        })
        .await?;

        reply_rx.await.map_err(|_| Error::DeviceRemoved)?
    }

    /// Read, pick the message accepted by `matcher`, and close the socket.
    ///
    /// Returns [`Error::Unparsable`] with the full reply if no message
    /// matches.
    pub async fn read_text(&self, command: &str, matcher: &ResponseMatcher) -> Result<String> {
        let reply = self.read(command).await?;
        let found = reply.extract(matcher).map(str::to_string);
        let ReadReply { text, session } = reply;
        session.close().await;

        found.ok_or_else(|| {
            Error::Unparsable(format!(
                "no {} reply to {}: {:?}",
                matcher.prefix, command, text
            ))
        })
    }

    /// Current state of the connection slot.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection slot transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The `host:port` this device connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Token cancelled on teardown; child tokens follow it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `true` once the device has been torn down.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tear the device down.
    ///
    /// Pending and in-flight requests are dropped unanswered, any open
    /// socket is closed, and later requests fail with
    /// [`Error::DeviceRemoved`].
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!(addr = %self.addr, "device teardown requested");
            self.cancel.cancel();
        }
    }

    /// Tear the device down and wait for the dispatch loop to exit.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DeviceIo {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the dispatch loop for one device.
///
/// `settings` is captured once; changing the address or power dialect
/// means tearing this device down and spawning a new one.
pub fn spawn_device_io(
    settings: &DeviceSettings,
    config: QueueConfig,
    connector: Arc<dyn Connector>,
) -> DeviceIo {
    let addr = settings.addr();
    let (tx, rx) = mpsc::channel::<Request>(config.channel_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let cancel = CancellationToken::new();

    let connection = Arc::new(Connection::new(
        addr.clone(),
        connector,
        config.clone(),
        state_tx,
        cancel.clone(),
    ));

    let task = tokio::spawn(dispatch_loop(rx, connection, config, cancel.clone()));

    DeviceIo {
        addr,
        tx,
        state: state_rx,
        cancel,
        next_seq: AtomicU64::new(1),
        task: Some(task),
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

/// Backlog plus the single connection slot.
struct Dispatcher {
    backlog: VecDeque<Request>,
    active: Option<JoinHandle<()>>,
    connection: Arc<Connection>,
    tick_interval: Duration,
}

impl Dispatcher {
    fn slot_free(&mut self) -> bool {
        if self.active.as_ref().is_some_and(|h| h.is_finished()) {
            self.active = None;
        }
        self.active.is_none()
    }

    /// One scheduler tick. Returns when the next tick is due, or `None`
    /// when there is nothing left to do.
    fn tick(&mut self) -> Option<Instant> {
        if self.slot_free() {
            while let Some(request) = self.backlog.pop_front() {
                if request.is_orphaned_read() {
                    warn!(
                        seq = request.seq(),
                        command = request.command(),
                        "read request has no waiting caller, skipping"
                    );
                    continue;
                }

                debug!(
                    seq = request.seq(),
                    command = request.command(),
                    mode = %request.mode(),
                    backlog = self.backlog.len(),
                    "dispatching request"
                );
                let connection = Arc::clone(&self.connection);
                self.active = Some(tokio::spawn(connection.run(request)));
                break;
            }
        }

        if self.active.is_some() || !self.backlog.is_empty() {
            Some(Instant::now() + self.tick_interval)
        } else {
            debug!("backlog empty, dispatch loop idle");
            None
        }
    }

    fn teardown(&mut self) {
        let dropped = self.backlog.len();
        self.backlog.clear();
        if let Some(active) = self.active.take() {
            if !active.is_finished() {
                debug!("abandoning in-flight request");
            }
        }
        debug!(dropped, "dispatch loop torn down");
    }
}

/// The main dispatch loop. Runs as a spawned tokio task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Cancellation
/// 2. Newly enqueued requests
/// 3. The scheduler tick
async fn dispatch_loop(
    mut rx: mpsc::Receiver<Request>,
    connection: Arc<Connection>,
    config: QueueConfig,
    cancel: CancellationToken,
) {
    let mut dispatcher = Dispatcher {
        backlog: VecDeque::new(),
        active: None,
        connection,
        tick_interval: config.tick_interval,
    };
    let mut next_tick: Option<Instant> = None;

    loop {
        let deadline = next_tick.unwrap_or_else(Instant::now);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            req = rx.recv() => match req {
                Some(request) => {
                    debug!(
                        seq = request.seq(),
                        command = request.command(),
                        mode = %request.mode(),
                        "request queued"
                    );
                    dispatcher.backlog.push_back(request);
                    // An idle loop wakes up immediately.
                    if next_tick.is_none() {
                        next_tick = dispatcher.tick();
                    }
                }
                None => {
                    debug!("request channel closed");
                    cancel.cancel();
                    break;
                }
            },

            _ = tokio::time::sleep_until(deadline), if next_tick.is_some() => {
                next_tick = dispatcher.tick();
            }
        }
    }

    rx.close();
    while rx.try_recv().is_ok() {}
    dispatcher.teardown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrlib_test_harness::{ConnectionScript, MockConnector, SocketEvent};

    fn settings() -> DeviceSettings {
        DeviceSettings::new("192.168.1.40")
    }

    fn spawn(mock: &MockConnector) -> DeviceIo {
        spawn_device_io(&settings(), QueueConfig::default(), Arc::new(mock.clone()))
    }

    // =======================================================================
    // Type construction tests
    // =======================================================================

    #[test]
    fn queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.inactivity_timeout, Duration::from_secs(5));
        assert_eq!(config.coalesce_delay, Duration::from_millis(100));
        assert_eq!(config.reconnect_guard, Duration::from_millis(100));
        assert_eq!(config.tick_interval, Duration::from_millis(50));
    }

    #[test]
    fn request_accessors() {
        let (reply_tx, _reply_rx) = oneshot::channel();
        let request = Request::Read {
            seq: 3,
            command: "MV?".into(),
            reply: reply_tx,
        };
        assert_eq!(request.seq(), 3);
        assert_eq!(request.command(), "MV?");
        assert_eq!(request.mode(), RequestMode::ReadHold);
        assert!(!request.is_orphaned_read());
    }

    #[test]
    fn read_without_receiver_is_orphaned() {
        let (reply_tx, reply_rx) = oneshot::channel();
        drop(reply_rx);
        let request = Request::Read {
            seq: 1,
            command: "PW?".into(),
            reply: reply_tx,
        };
        assert!(request.is_orphaned_read());

        let (reply_tx, reply_rx) = oneshot::channel();
        drop(reply_rx);
        let request = Request::Write {
            seq: 2,
            command: "PWON".into(),
            reply: reply_tx,
        };
        assert!(!request.is_orphaned_read());
    }

    // =======================================================================
    // Write-close path
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn write_close_sends_and_closes() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MUON\r"));
        let io = spawn(&mock);

        io.write("MUON").await.unwrap();

        assert_eq!(mock.sent_commands(), vec!["MUON"]);
        assert_eq!(mock.connect_addrs(), vec!["192.168.1.40:23"]);
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_reported() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::refuse());
        let io = spawn(&mock);

        let result = io.write("PWON").await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    // =======================================================================
    // Read-hold path
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn read_returns_reply_and_holds_socket() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"PWON\r"));
        let io = spawn(&mock);

        let reply = io.read("PW?").await.unwrap();
        assert_eq!(reply.text, "PWON\r");
        assert_eq!(io.connection_state(), ConnectionState::Held);
        assert_eq!(mock.open_connections(), 1);

        reply.session.close().await;
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_coalesces_split_reply() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"MV?\r")
                .reply(b"MV4")
                .reply_after(Duration::from_millis(40), b"5\r")
                .reply_after(Duration::from_millis(60), b"MVMAX 98\r"),
        );
        let io = spawn(&mock);

        let reply = io.read("MV?").await.unwrap();
        assert_eq!(reply.text, "MV45\rMVMAX 98\r");
    }

    #[tokio::test(start_paused = true)]
    async fn coalescing_stops_after_quiet_gap() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"SI?\r")
                .reply(b"SITUNER\r")
                .reply_after(Duration::from_millis(300), b"SVOFF\r"),
        );
        let io = spawn(&mock);

        let reply = io.read("SI?").await.unwrap();
        assert_eq!(reply.text, "SITUNER\r");

        let more = reply.session.read_more().await.unwrap();
        assert_eq!(more, "SVOFF\r");
    }

    #[tokio::test(start_paused = true)]
    async fn read_text_extracts_and_releases() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"MV?\r")
                .reply(b"MVMAX 98\rMV205\r"),
        );
        let io = spawn(&mock);

        let matcher = ResponseMatcher::prefix("MV").excluding("MVMAX");
        let text = io.read_text("MV?", &matcher).await.unwrap();
        assert_eq!(text, "MV205");
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_text_without_match_is_unparsable() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"Z2ON\r"));
        let io = spawn(&mock);

        let result = io.read_text("PW?", &ResponseMatcher::prefix("PW")).await;
        assert!(matches!(result, Err(Error::Unparsable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn error_sentinel_is_device_reported() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"XX?\r").reply(b"SSINFAI\r"));
        let io = spawn(&mock);

        match io.read("XX?").await {
            Err(Error::DeviceReported(raw)) => assert_eq!(raw, "SSINFAI"),
            other => panic!("expected DeviceReported, got {:?}", other.map(|r| r.text)),
        }
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_write_follows_up_on_same_socket() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"MU?\r")
                .reply(b"MUON\r")
                .expect(b"MUOFF\r"),
        );
        let io = spawn(&mock);

        let reply = io.read("MU?").await.unwrap();
        reply.session.write("MUOFF").await.unwrap();
        reply.session.close().await;

        assert_eq!(mock.connect_count(), 1);
        assert_eq!(mock.sent_commands(), vec!["MU?", "MUOFF"]);
    }

    // =======================================================================
    // Timeouts
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn connect_timeout() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::stall());
        let io = spawn(&mock);

        let start = Instant::now();
        let result = io.write("PWON").await;
        assert!(matches!(result, Err(Error::ConnectTimeout)));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_within_timeout_succeeds() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .connect_after(Duration::from_millis(800))
                .expect(b"PWON\r"),
        );
        let io = spawn(&mock);

        io.write("PWON").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timeout_on_silent_receiver() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r"));
        let io = spawn(&mock);

        let start = Instant::now();
        let result = io.read("PW?").await;
        assert!(matches!(result, Err(Error::InactivityTimeout)));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn held_session_expires_when_idle() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"PWON\r"));
        mock.push(ConnectionScript::new().expect(b"MUON\r"));
        let io = spawn(&mock);

        let reply = io.read("PW?").await.unwrap();
        // The session is never released; the queued write still runs once
        // the held socket idles out.
        let start = Instant::now();
        io.write("MUON").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));

        assert!(matches!(
            reply.session.write("PWON").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn peer_closed_session_frees_slot_after_guard() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"PW?\r")
                .reply(b"PWON\r")
                .then_close(),
        );
        mock.push(ConnectionScript::new().expect(b"MUON\r"));
        let io = spawn(&mock);

        let reply = io.read("PW?").await.unwrap();
        assert!(matches!(
            reply.session.read_more().await,
            Err(Error::ConnectionLost)
        ));

        // The session handle is still alive, but its socket is gone.
        let start = Instant::now();
        io.write("MUON").await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(mock.max_open_connections(), 1);
        drop(reply);
    }

    // =======================================================================
    // Queue discipline
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn requests_complete_in_fifo_order() {
        let mock = MockConnector::new();
        for cmd in ["PWON", "MUON", "MV490", "SITUNER"] {
            mock.push(ConnectionScript::new().expect(format!("{cmd}\r").as_bytes()));
        }
        let io = Arc::new(spawn(&mock));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for cmd in ["PWON", "MUON", "MV490", "SITUNER"] {
            let io = Arc::clone(&io);
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                io.write(cmd).await.unwrap();
                let _ = done_tx.send(cmd);
            });
            tokio::task::yield_now().await;
        }
        drop(done_tx);

        let mut order = Vec::new();
        while let Some(cmd) = done_rx.recv().await {
            order.push(cmd);
        }
        assert_eq!(order, vec!["PWON", "MUON", "MV490", "SITUNER"]);
        assert_eq!(mock.sent_commands(), order);
    }

    #[tokio::test(start_paused = true)]
    async fn one_socket_at_a_time_with_reconnect_guard() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"PWON\r"));
        mock.push(ConnectionScript::new().expect(b"MU?\r").reply(b"MUOFF\r"));
        mock.push(ConnectionScript::new().expect(b"MVUP\r"));
        let io = spawn(&mock);

        let matcher_pw = ResponseMatcher::prefix("PW");
        let matcher_mu = ResponseMatcher::prefix("MU");
        let (a, b, c) = tokio::join!(
            io.read_text("PW?", &matcher_pw),
            io.read_text("MU?", &matcher_mu),
            io.write("MVUP"),
        );
        assert_eq!(a.unwrap(), "PWON");
        assert_eq!(b.unwrap(), "MUOFF");
        c.unwrap();

        assert_eq!(mock.max_open_connections(), 1);

        let events = mock.socket_events();
        assert_eq!(events.len(), 6);
        for pair in events.windows(2) {
            if let [SocketEvent::Closed(closed), SocketEvent::Connected(next)] = pair {
                assert!(*next - *closed >= Duration::from_millis(100));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_does_not_block_queue() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::refuse());
        mock.push(ConnectionScript::new().expect(b"MUOFF\r"));
        let io = spawn(&mock);

        let (first, second) = tokio::join!(io.write("MUON"), io.write("MUOFF"));
        assert!(first.is_err());
        second.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_read_never_connects() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"PWON\r"));
        mock.push(ConnectionScript::new().expect(b"MUON\r"));
        let io = spawn(&mock);

        let held = io.read("PW?").await.unwrap();

        // Queue a read and give up on it while the slot is busy.
        let abandoned = tokio::time::timeout(Duration::from_millis(10), io.read("MU?")).await;
        assert!(abandoned.is_err());

        held.session.close().await;
        io.write("MUON").await.unwrap();

        assert_eq!(mock.sent_commands(), vec!["PW?", "MUON"]);
    }

    #[tokio::test(start_paused = true)]
    async fn state_returns_to_idle_after_guard() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MUON\r"));
        let io = spawn(&mock);
        let mut states = io.subscribe_state();

        io.write("MUON").await.unwrap();
        while *states.borrow_and_update() != ConnectionState::Idle {
            states.changed().await.unwrap();
        }
        assert_eq!(io.connection_state(), ConnectionState::Idle);
    }

    // =======================================================================
    // Teardown
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn teardown_drops_in_flight_and_queued_requests() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r"));
        let io = Arc::new(spawn(&mock));

        let in_flight = tokio::spawn({
            let io = Arc::clone(&io);
            async move { io.read("PW?").await.map(|r| r.text) }
        });
        tokio::task::yield_now().await;
        let queued = tokio::spawn({
            let io = Arc::clone(&io);
            async move { io.write("MUON").await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        io.shutdown();

        assert!(matches!(in_flight.await.unwrap(), Err(Error::DeviceRemoved)));
        assert!(matches!(queued.await.unwrap(), Err(Error::DeviceRemoved)));
        assert!(io.is_shut_down());

        // The silent receiver's inactivity timeout would have fired here;
        // nothing may happen after teardown.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.sent_commands(), vec!["PW?"]);
        assert_eq!(mock.open_connections(), 0);
        assert_eq!(io.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_while_held_resets_state() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"PWON\r"));
        let io = spawn(&mock);

        let reply = io.read("PW?").await.unwrap();
        assert_eq!(io.connection_state(), ConnectionState::Held);

        io.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(io.connection_state(), ConnectionState::Idle);
        assert_eq!(mock.open_connections(), 0);
        drop(reply);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_after_teardown_fail() {
        let mock = MockConnector::new();
        let io = spawn(&mock);
        io.shutdown();

        assert!(matches!(io.write("PWON").await, Err(Error::DeviceRemoved)));
        assert!(matches!(io.read("PW?").await, Err(Error::DeviceRemoved)));
        assert_eq!(mock.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_tears_down() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"PWON\r"));
        let io = spawn(&mock);
        let token = io.cancel_token();

        let reply = io.read("PW?").await.unwrap();
        drop(io);
        assert!(token.is_cancelled());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.open_connections(), 0);
        assert!(matches!(
            reply.session.write("MUON").await,
            Err(Error::NotConnected)
        ));
    }
}
