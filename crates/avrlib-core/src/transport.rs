//! Transport and connector traits for receiver communication.
//!
//! The [`Transport`] trait abstracts over one open socket to a receiver.
//! The [`Connector`] trait opens a fresh [`Transport`] per request: the
//! receiver's telnet listener is used connect-per-command, so the command
//! queue never keeps a long-lived stream around.
//!
//! The connection state machine in `avrlib-text-io` operates on these
//! traits rather than on a `TcpStream`, enabling both real network control
//! (`TcpConnector` in `avrlib-transport`) and deterministic unit testing
//! with `MockConnector` from the `avrlib-test-harness` crate.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a receiver.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the receiver.
    ///
    /// Returns once all bytes have been written and flushed to the
    /// underlying socket. The write-close path treats this as the
    /// "bytes flushed" acknowledgment.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the receiver into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline and
    /// [`Error::ConnectionLost`](crate::error::Error::ConnectionLost) if the
    /// peer closed the socket.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    /// Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Opens a new [`Transport`] to a receiver address.
///
/// Connect timeouts are enforced by the caller, so implementations may
/// simply await the underlying connect.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `addr` (a `host:port` string).
    async fn connect(&self, addr: &str) -> Result<Box<dyn Transport>>;
}
