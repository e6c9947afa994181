//! Asynchronous receiver event types.
//!
//! Events are emitted through a [`tokio::sync::broadcast`] channel when the
//! status poller (or an optimistic write) observes a change. Home automation
//! flows subscribe to these instead of comparing snapshots themselves.

use crate::types::PollMode;

/// An event emitted when receiver state changes.
///
/// Events are delivered on a best-effort basis through a bounded broadcast
/// channel; slow consumers may miss events.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    /// The input source changed since the previous poll.
    ///
    /// Never emitted for the very first observation.
    SourceChanged {
        /// New source label with the `SI` prefix stripped.
        source: String,
    },

    /// Power state changed.
    PowerChanged {
        /// `true` if the receiver is now on.
        on: bool,
    },

    /// Mute state changed.
    MuteChanged {
        /// `true` if the receiver is now muted.
        muted: bool,
    },

    /// Master volume changed.
    VolumeChanged {
        /// New volume normalised to `0.0..=1.0`.
        volume: f32,
    },

    /// The status poller switched cadence.
    PollModeChanged {
        /// The new cadence.
        mode: PollMode,
    },
}
