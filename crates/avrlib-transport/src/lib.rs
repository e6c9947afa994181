//! Transport implementations for avrlib.
//!
//! This crate provides the concrete implementations of the
//! [`Transport`](avrlib_core::Transport) and [`Connector`](avrlib_core::Connector)
//! traits from `avrlib-core`:
//!
//! - [`TcpTransport`]: one telnet-style TCP socket to a receiver
//! - [`TcpConnector`]: opens a fresh [`TcpTransport`] for each queued request
//!
//! # Example
//!
//! ```no_run
//! use avrlib_transport::TcpConnector;
//! use avrlib_core::transport::Connector;
//!
//! # async fn example() -> avrlib_core::Result<()> {
//! let connector = TcpConnector::new();
//! let mut transport = connector.connect("192.168.1.40:23").await?;
//! transport.send(b"MUON\r").await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod tcp;

pub use tcp::{TcpConnector, TcpTransport};
