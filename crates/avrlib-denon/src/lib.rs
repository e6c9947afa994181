//! Denon/Marantz telnet protocol backend for avrlib.
//!
//! This crate drives the carriage-return-terminated ASCII protocol that
//! Denon and Marantz receivers expose on TCP port 23. It provides:
//!
//! - **Command builders** ([`commands`]) -- construct power, volume, mute,
//!   and source commands and parse the corresponding replies.
//! - **Status poller** ([`poller`]) -- background power/mute/volume/source
//!   queries with a fast/slow cadence chosen by recent failures.
//! - **Receiver facade** ([`receiver`]) -- capability operations on top of
//!   the command queue from `avrlib-text-io`, cached state, and events.
//! - **Builder** ([`builder`]) -- fluent builder API for constructing
//!   [`DenonReceiver`] instances.
//!
//! # Protocol notes
//!
//! - Commands and replies end in `\r`; one reply may carry several messages.
//! - Volume is three digits of tenths of a dB (`MV455` = 45.5 dB); whole
//!   values may come back as two digits (`MV45`).
//! - A volume query is followed by an `MVMAX nn` line, never the value.
//! - `SSINFAI` is the receiver's error answer.
//!
//! # Example
//!
//! ```
//! use avrlib_denon::commands::{cmd_set_volume, parse_volume_response};
//!
//! assert_eq!(cmd_set_volume(0.5).unwrap(), "MV490");
//! assert_eq!(parse_volume_response("MV45").unwrap(), 450);
//! ```

pub mod builder;
mod cache;
pub mod commands;
pub mod poller;
pub mod receiver;

// Re-export the primary types for ergonomic `use avrlib_denon::*`.
pub use builder::DenonBuilder;
pub use poller::{PollConfig, StatusPoller};
pub use receiver::DenonReceiver;
