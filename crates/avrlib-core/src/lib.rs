//! avrlib-core: Core traits, types, and error definitions for avrlib.
//!
//! This crate defines the protocol-agnostic pieces that the command queue,
//! the transports, and the receiver backend share. Applications depend on
//! these types without pulling in a specific transport.
//!
//! # Key types
//!
//! - [`Transport`] / [`Connector`] -- byte-level socket and its factory
//! - [`ReceiverEvent`] -- asynchronous state change notifications
//! - [`DeviceSettings`] / [`ReceiverState`] -- settings snapshot and cached values
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use avrlib_core::*`.
pub use error::{Error, Result};
pub use events::ReceiverEvent;
pub use transport::{Connector, Transport};
pub use types::*;
