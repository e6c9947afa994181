//! Error types for avrlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Connection timeouts, socket failures,
//! device-reported errors, and malformed replies are all captured here.

/// The error type for all avrlib operations.
///
/// The variants follow the failure modes of a telnet-controlled receiver:
/// the socket never connects, the receiver goes quiet, the transport
/// breaks, the receiver answers with its error sentinel, or it answers
/// with something that cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The TCP connection was not established within the connect timeout.
    ///
    /// Usually the address is wrong or Network Control is disabled on the
    /// receiver.
    #[error("timed out connecting to receiver")]
    ConnectTimeout,

    /// No bytes arrived within the inactivity timeout after connecting.
    #[error("receiver went silent (inactivity timeout)")]
    InactivityTimeout,

    /// A single transport read found no data within its deadline.
    ///
    /// Returned by [`Transport::receive`](crate::transport::Transport::receive);
    /// the connection layer turns it into [`Error::InactivityTimeout`] or
    /// treats it as the end of a coalescing window.
    #[error("timeout waiting for data")]
    Timeout,

    /// A transport-level error (refused connection, socket setup failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// The receiver closed the connection unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// The receiver answered with its error sentinel (`SSINFAI...`).
    ///
    /// Carries the raw text so callers can still log what the device said.
    #[error("receiver reported an error: {0}")]
    DeviceReported(String),

    /// The receiver answered with something that could not be parsed.
    #[error("unparsable response: {0}")]
    Unparsable(String),

    /// An invalid parameter was passed to a receiver command.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The transport is closed or was never opened.
    #[error("not connected")]
    NotConnected,

    /// The device was torn down while the request was queued or in flight.
    #[error("device removed")]
    DeviceRemoved,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// `true` for errors raised by the socket or its timers rather than by
    /// the content of a reply.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout
                | Error::InactivityTimeout
                | Error::Timeout
                | Error::Transport(_)
                | Error::ConnectionLost
                | Error::NotConnected
                | Error::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
