//! Text-protocol command queue for avrlib.
//!
//! This crate turns a stream of commands from many callers into strictly
//! serialized, one-socket-at-a-time telnet exchanges with a single
//! receiver. One tokio task per device owns the backlog and the connection
//! slot; callers talk to it through a [`DeviceIo`] handle.
//!
//! # Architecture
//!
//! - [`protocol`] -- CR-terminated framing, reply splitting and matching
//! - [`connection`] -- per-request socket lifecycle and held sessions
//! - [`io`] -- the dispatch loop, its configuration, and the device handle

pub mod connection;
pub mod io;
pub mod protocol;

pub use connection::{ConnectionState, ReadReply, Session};
pub use io::{DeviceIo, QueueConfig, Request, spawn_device_io};
pub use protocol::ResponseMatcher;
