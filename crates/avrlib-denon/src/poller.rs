//! Periodic status poller.
//!
//! Every cycle issues the four status queries (power, mute, volume,
//! source) through the device's command queue, stores whatever parses, and
//! re-arms once all four have completed. The re-arm delay depends on the
//! failure history:
//!
//! - each cycle with at least one failed query uses up one unit of the
//!   failure ceiling; when it is used up the poller drops to the slow delay;
//! - a single cycle without failures refills the ceiling and, if the poller
//!   was slow, returns it to the fast delay immediately.
//!
//! There is no offline state: a receiver that stays unreachable is polled
//! at the slow delay forever and recovers on the first good cycle.
//!
//! Replies that arrive but cannot be parsed are logged and leave the cached
//! value alone; they do not count as failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use avrlib_core::error::{Error, Result};
use avrlib_core::types::{PollMode, PowerCommand};
use avrlib_text_io::{DeviceIo, ResponseMatcher};

use crate::cache::StatusCache;
use crate::commands;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Status poller timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between cycles while the receiver answers (default 2s).
    pub fast_delay: Duration,
    /// Delay between cycles after a full streak of failures (default 60s).
    pub slow_delay: Duration,
    /// Consecutive failing cycles before switching to the slow delay
    /// (default 9).
    pub failure_ceiling: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            fast_delay: Duration::from_secs(2),
            slow_delay: Duration::from_secs(60),
            failure_ceiling: 9,
        }
    }
}

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

/// Consecutive-failure counter with hysteresis between fast and slow mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureStreak {
    ceiling: u32,
    remaining: u32,
    mode: PollMode,
}

impl FailureStreak {
    /// Start in fast mode with the full ceiling available.
    ///
    /// A ceiling of zero is treated as one.
    pub fn new(ceiling: u32) -> Self {
        let ceiling = ceiling.max(1);
        FailureStreak {
            ceiling,
            remaining: ceiling,
            mode: PollMode::Fast,
        }
    }

    /// Current polling mode.
    pub fn mode(&self) -> PollMode {
        self.mode
    }

    /// Failing cycles left before the switch to slow mode.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Record a finished cycle with `failures` failed queries.
    ///
    /// Returns the new mode if this cycle caused a transition.
    pub fn record_cycle(&mut self, failures: u32) -> Option<PollMode> {
        if failures == 0 {
            self.remaining = self.ceiling;
            if self.mode == PollMode::Slow {
                self.mode = PollMode::Fast;
                return Some(PollMode::Fast);
            }
            return None;
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 && self.mode == PollMode::Fast {
            self.mode = PollMode::Slow;
            return Some(PollMode::Slow);
        }
        None
    }

    /// Delay before the next cycle.
    pub fn next_delay(&self, config: &PollConfig) -> Duration {
        match self.mode {
            PollMode::Fast => config.fast_delay,
            PollMode::Slow => config.slow_delay,
        }
    }
}

/// Per-cycle completion and failure counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCycle {
    remaining: u32,
    failures: u32,
}

impl PollCycle {
    /// Number of queries issued per cycle.
    pub const QUERIES: u32 = 4;

    /// Counters for a fresh cycle.
    pub fn start() -> Self {
        PollCycle {
            remaining: Self::QUERIES,
            failures: 0,
        }
    }

    /// Record one completed query. Returns `true` once every query of the
    /// cycle has completed.
    pub fn complete(&mut self, failed: bool) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            if failed {
                self.failures += 1;
            }
        }
        self.is_complete()
    }

    /// `true` when no query is outstanding.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Failed queries so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ---------------------------------------------------------------------------
// Poller task
// ---------------------------------------------------------------------------

/// Handle to a running status poller.
///
/// Dropping the handle stops the poller.
pub struct StatusPoller {
    cancel: CancellationToken,
    mode: watch::Receiver<PollMode>,
    task: Option<JoinHandle<()>>,
}

impl StatusPoller {
    /// Spawn a poller for the device behind `io`.
    ///
    /// The first cycle starts immediately. The poller stops when `cancel`
    /// (or its parent) is cancelled.
    pub(crate) fn spawn(
        io: Arc<DeviceIo>,
        dialect: PowerCommand,
        config: PollConfig,
        cache: Arc<StatusCache>,
        cancel: CancellationToken,
    ) -> Self {
        let (mode_tx, mode_rx) = watch::channel(PollMode::Fast);
        let task = tokio::spawn(poll_loop(
            io,
            dialect,
            config,
            cache,
            mode_tx,
            cancel.clone(),
        ));
        StatusPoller {
            cancel,
            mode: mode_rx,
            task: Some(task),
        }
    }

    /// Current polling mode.
    pub fn mode(&self) -> PollMode {
        *self.mode.borrow()
    }

    /// Watch polling mode transitions.
    pub fn subscribe_mode(&self) -> watch::Receiver<PollMode> {
        self.mode.clone()
    }

    /// Stop polling. An in-flight cycle is abandoned.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop polling and wait for the task to exit.
    pub async fn join(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    io: Arc<DeviceIo>,
    dialect: PowerCommand,
    config: PollConfig,
    cache: Arc<StatusCache>,
    mode_tx: watch::Sender<PollMode>,
    cancel: CancellationToken,
) {
    let mut streak = FailureStreak::new(config.failure_ceiling);
    debug!(addr = io.addr(), "status poller started");

    loop {
        let cycle = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            cycle = poll_cycle(&io, dialect, &cache) => cycle,
        };

        if let Some(mode) = streak.record_cycle(cycle.failures()) {
            match mode {
                PollMode::Slow => warn!(
                    addr = io.addr(),
                    failed_cycles = config.failure_ceiling,
                    "receiver not answering, switching to slow polling"
                ),
                PollMode::Fast => info!(addr = io.addr(), "receiver answering again, fast polling"),
            }
            mode_tx.send_replace(mode);
            cache.poll_mode_changed(mode);
        }

        let delay = streak.next_delay(&config);
        debug!(
            failures = cycle.failures(),
            remaining = streak.remaining(),
            delay_ms = delay.as_millis() as u64,
            "poll cycle complete"
        );

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(addr = io.addr(), "status poller stopped");
}

/// Run one cycle: four queries, all completed before returning.
pub(crate) async fn poll_cycle(
    io: &DeviceIo,
    dialect: PowerCommand,
    cache: &StatusCache,
) -> PollCycle {
    let power_matcher = commands::power_matcher(dialect);
    let mute_matcher = commands::mute_matcher();
    let volume_matcher = commands::volume_matcher();
    let source_matcher = commands::source_matcher();

    let power_cmd = commands::cmd_query_power(dialect);
    let mute_cmd = commands::cmd_query_mute();
    let volume_cmd = commands::cmd_query_volume();
    let source_cmd = commands::cmd_query_source();

    let (power, mute, volume, source) = tokio::join!(
        query(io, &power_cmd, &power_matcher, |msg| {
            cache.set_power(commands::parse_power_response(msg, dialect)?);
            Ok(())
        }),
        query(io, &mute_cmd, &mute_matcher, |msg| {
            cache.set_muted(commands::parse_mute_response(msg)?);
            Ok(())
        }),
        query(io, &volume_cmd, &volume_matcher, |msg| {
            let units = commands::parse_volume_response(msg)?;
            cache.set_volume(commands::volume_units_to_level(units));
            Ok(())
        }),
        query(io, &source_cmd, &source_matcher, |msg| {
            cache.observe_source(commands::parse_source_response(msg)?);
            Ok(())
        }),
    );

    let mut cycle = PollCycle::start();
    for failed in [power, mute, volume, source] {
        cycle.complete(failed);
    }
    cycle
}

/// Issue one query and apply the reply. Returns `true` if the query failed.
async fn query(
    io: &DeviceIo,
    command: &str,
    matcher: &ResponseMatcher,
    apply: impl FnOnce(&str) -> Result<()>,
) -> bool {
    let outcome = match io.read_text(command, matcher).await {
        Ok(message) => apply(&message),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => false,
        Err(Error::Unparsable(detail)) => {
            warn!(command, detail = %detail, "unparsable status reply, keeping cached value");
            false
        }
        Err(e) => {
            debug!(command, error = %e, "status query failed");
            true
        }
    }
}
