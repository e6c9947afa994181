//! Simulated receiver speaking the telnet control protocol.
//!
//! Unlike [`MockTcpServer`](crate::MockTcpServer), which replays a fixed
//! script, [`MockReceiver`] keeps power, mute, volume and source state and
//! answers queries from it, so it can back end-to-end tests and the test
//! application's `--mock` mode.
//!
//! Replies mimic real units closely enough to exercise the reply parsers:
//! `MV?` is followed by an `MVMAX` line, `SI?` by an `SV` video mode line,
//! and unknown commands get the `SSINFAI` error sentinel.

use avrlib_core::error::{Error, Result};
use avrlib_core::types::PowerCommand;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Observable state of a [`MockReceiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReceiverState {
    /// `true` when on.
    pub power: bool,
    /// `true` when muted.
    pub muted: bool,
    /// Master volume in half-dB units, `0..=980`.
    pub volume: u16,
    /// Current source token, e.g. `"TUNER"`.
    pub source: String,
    /// Every command received, in order, without the terminator.
    pub received: Vec<String>,
    /// Number of connections accepted.
    pub connections: usize,
    /// Connections currently open.
    pub open: usize,
    /// Highest number of connections open at once.
    pub max_open: usize,
}

impl Default for MockReceiverState {
    fn default() -> Self {
        MockReceiverState {
            power: false,
            muted: false,
            volume: 400,
            source: "TUNER".to_string(),
            received: Vec::new(),
            connections: 0,
            open: 0,
            max_open: 0,
        }
    }
}

fn lock(state: &Mutex<MockReceiverState>) -> MutexGuard<'_, MockReceiverState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A simulated receiver listening on a random localhost port.
///
/// The listener runs until the `MockReceiver` is dropped.
pub struct MockReceiver {
    addr: String,
    state: Arc<Mutex<MockReceiverState>>,
    accept_task: JoinHandle<()>,
}

impl MockReceiver {
    /// Start a simulated receiver speaking the given power dialect.
    pub async fn start(power_command: PowerCommand) -> Result<Self> {
        Self::start_with_state(power_command, MockReceiverState::default()).await
    }

    /// Start a simulated receiver with a preset state.
    pub async fn start_with_state(
        power_command: PowerCommand,
        initial: MockReceiverState,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock receiver: {}", e)))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();
        let state = Arc::new(Mutex::new(initial));

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!(%peer, "mock receiver accepted connection");
                {
                    let mut s = lock(&accept_state);
                    s.connections += 1;
                    s.open += 1;
                    s.max_open = s.max_open.max(s.open);
                }
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    serve(stream, power_command, &conn_state).await;
                    let mut s = lock(&conn_state);
                    s.open = s.open.saturating_sub(1);
                });
            }
        });

        Ok(MockReceiver {
            addr,
            state,
            accept_task,
        })
    }

    /// The `host:port` address of the listener.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Host part of [`addr`](MockReceiver::addr).
    pub fn host(&self) -> &str {
        self.addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.addr)
    }

    /// Port part of [`addr`](MockReceiver::addr).
    pub fn port(&self) -> u16 {
        self.addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(0)
    }

    /// Snapshot of the simulated state.
    pub fn state(&self) -> MockReceiverState {
        lock(&self.state).clone()
    }

    /// Change the simulated state, e.g. to emulate the front panel.
    pub fn update(&self, f: impl FnOnce(&mut MockReceiverState)) {
        f(&mut lock(&self.state));
    }
}

impl Drop for MockReceiver {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(mut stream: TcpStream, power_command: PowerCommand, state: &Mutex<MockReceiverState>) {
    let mut pending = String::new();
    let mut buf = [0u8; 256];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.push_str(&String::from_utf8_lossy(&buf[..n]));

        while let Some(end) = pending.find('\r') {
            let command: String = pending.drain(..=end).collect();
            let command = command.trim_end_matches('\r');
            trace!(command, "mock receiver command");
            let reply = respond(command, power_command, &mut lock(state));
            if !reply.is_empty() && stream.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Apply one command to the simulated state and build the reply text.
fn respond(command: &str, power_command: PowerCommand, state: &mut MockReceiverState) -> String {
    state.received.push(command.to_string());

    let prefix = power_command.prefix();
    let off = power_command.off_keyword();

    if let Some(rest) = command.strip_prefix(prefix) {
        match rest {
            "?" => {}
            "ON" => state.power = true,
            r if r == off => state.power = false,
            _ => return "SSINFAI\r".to_string(),
        }
        let keyword = if state.power { "ON" } else { off };
        return format!("{prefix}{keyword}\r");
    }

    if let Some(rest) = command.strip_prefix("MU") {
        match rest {
            "?" => {}
            "ON" => state.muted = true,
            "OFF" => state.muted = false,
            _ => return "SSINFAI\r".to_string(),
        }
        return if state.muted { "MUON\r" } else { "MUOFF\r" }.to_string();
    }

    if let Some(rest) = command.strip_prefix("MV") {
        match rest {
            "?" => {}
            "UP" => state.volume = (state.volume + 5).min(980),
            "DOWN" => state.volume = state.volume.saturating_sub(5),
            digits if digits.len() == 3 && digits.bytes().all(|b| b.is_ascii_digit()) => {
                state.volume = digits.parse::<u16>().unwrap_or(0).min(980);
            }
            digits if digits.len() == 2 && digits.bytes().all(|b| b.is_ascii_digit()) => {
                state.volume = (digits.parse::<u16>().unwrap_or(0) * 10).min(980);
            }
            _ => return "SSINFAI\r".to_string(),
        }
        return format!("{}\rMVMAX 98\r", volume_reply(state.volume));
    }

    if let Some(rest) = command.strip_prefix("SI") {
        if rest.is_empty() {
            return "SSINFAI\r".to_string();
        }
        if rest != "?" {
            state.source = rest.to_string();
        }
        return format!("SI{}\rSVOFF\r", state.source);
    }

    "SSINFAI\r".to_string()
}

/// Real units answer whole-dB volumes with two digits.
fn volume_reply(volume: u16) -> String {
    if volume % 10 == 0 {
        format!("MV{:02}", volume / 10)
    } else {
        format!("MV{:03}", volume)
    }
}
