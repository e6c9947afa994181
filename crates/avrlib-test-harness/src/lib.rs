//! avrlib-test-harness: Test utilities, mock connectors, and a simulated
//! receiver for avrlib.
//!
//! This crate provides [`MockConnector`] for deterministic, paused-clock
//! unit testing of the command queue without a network,
//! [`MockTcpServer`] for replaying scripted connections over real
//! localhost sockets, and [`MockReceiver`] for end-to-end tests against a
//! stateful fake receiver.

pub mod mock_connector;
pub mod mock_receiver;
pub mod mock_tcp;

pub use mock_connector::{ConnectionScript, MockConnector, MockTransport, SocketEvent};
pub use mock_receiver::{MockReceiver, MockReceiverState};
pub use mock_tcp::MockTcpServer;
