//! # avrlib -- Network Control for Denon/Marantz Receivers
//!
//! `avrlib` is an asynchronous Rust library for controlling Denon and
//! Marantz audio/video receivers over their telnet control port. It is
//! designed for home automation bridges where several flows drive the
//! same receiver and the receiver itself tolerates only one connection at
//! a time.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! avrlib = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Connect to a receiver and change the volume:
//!
//! ```no_run
//! use avrlib::DenonBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let avr = DenonBuilder::new("192.168.1.40").build().await?;
//!
//!     avr.set_power(true).await?;
//!     avr.set_volume(0.4).await?;
//!     println!("muted now: {}", avr.toggle_mute().await?);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                 | Purpose                                          |
//! |-----------------------|--------------------------------------------------|
//! | `avrlib-core`         | Transport traits, types, events, errors          |
//! | `avrlib-transport`    | TCP transport and connector                      |
//! | `avrlib-text-io`      | Framing, connection lifecycle, FIFO command queue |
//! | `avrlib-denon`        | Commands, status poller, receiver facade         |
//! | **`avrlib`**          | This facade crate -- re-exports everything       |
//!
//! Every request opens its own TCP connection. Requests to one receiver are
//! served strictly in order, one socket at a time, with a short settling
//! gap between sockets.
//!
//! ## Event Subscription
//!
//! The background poller refreshes the cached state and broadcasts a
//! [`ReceiverEvent`] whenever a known value changes:
//!
//! ```no_run
//! use avrlib::{DenonReceiver, ReceiverEvent};
//! # async fn example(avr: &DenonReceiver) {
//! let mut events = avr.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let ReceiverEvent::SourceChanged { source } = event {
//!         println!("source is now {source}");
//!     }
//! }
//! # }
//! ```

pub use avrlib_core::*;

/// Denon/Marantz protocol backend.
///
/// Provides [`DenonReceiver`](denon::DenonReceiver) and
/// [`DenonBuilder`](denon::DenonBuilder) plus the raw command builders and
/// reply parsers in [`denon::commands`].
pub mod denon {
    pub use avrlib_denon::*;
}

/// Framing and the per-device command queue.
///
/// Useful for talking to a receiver without the status poller, or for
/// commands the receiver facade does not cover.
pub mod io {
    pub use avrlib_text_io::*;
}

/// TCP transport implementation.
pub mod tcp {
    pub use avrlib_transport::*;
}

pub use avrlib_denon::{DenonBuilder, DenonReceiver, PollConfig};
pub use avrlib_text_io::{ConnectionState, QueueConfig, ReadReply, Session};
