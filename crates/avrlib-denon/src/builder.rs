//! DenonBuilder -- fluent builder for constructing [`DenonReceiver`] instances.
//!
//! Separates configuration from construction so that callers can set the
//! address, power dialect, queue timings, and polling cadence before the
//! command queue and poller are spawned.
//!
//! # Example
//!
//! ```no_run
//! use avrlib_denon::builder::DenonBuilder;
//! use avrlib_core::types::PowerCommand;
//! use std::time::Duration;
//!
//! # async fn example() -> avrlib_core::Result<()> {
//! let avr = DenonBuilder::new("192.168.1.40")
//!     .power_command(PowerCommand::Zm)
//!     .connect_timeout(Duration::from_secs(2))
//!     .build()
//!     .await?;
//! avr.set_mute(true).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use avrlib_core::error::{Error, Result};
use avrlib_core::transport::Connector;
use avrlib_core::types::{DeviceSettings, PowerCommand, TELNET_PORT};
use avrlib_text_io::{QueueConfig, spawn_device_io};
use avrlib_transport::TcpConnector;

use crate::cache::StatusCache;
use crate::poller::{PollConfig, StatusPoller};
use crate::receiver::DenonReceiver;

/// Fluent builder for [`DenonReceiver`].
///
/// Everything except the host has a default, so the simplest usage is:
///
/// ```ignore
/// let avr = DenonBuilder::new("192.168.1.40").build().await?;
/// ```
pub struct DenonBuilder {
    host: String,
    port: u16,
    power_command: PowerCommand,
    queue: QueueConfig,
    poll: PollConfig,
    polling: bool,
    event_capacity: usize,
}

impl DenonBuilder {
    /// Create a new builder for the receiver at `host`.
    pub fn new(host: &str) -> Self {
        DenonBuilder {
            host: host.trim().to_string(),
            port: TELNET_PORT,
            power_command: PowerCommand::default(),
            queue: QueueConfig::default(),
            poll: PollConfig::default(),
            polling: true,
            event_capacity: 64,
        }
    }

    /// Override the telnet port (default: 23).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the power command dialect (default: `PW`).
    pub fn power_command(mut self, dialect: PowerCommand) -> Self {
        self.power_command = dialect;
        self
    }

    /// Replace all queue timings at once.
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// How long a TCP connect may take (default: 1s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.queue.connect_timeout = timeout;
        self
    }

    /// How long a connection may stay silent (default: 5s).
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.queue.inactivity_timeout = timeout;
        self
    }

    /// Quiet gap that ends a multi-segment reply (default: 100ms).
    pub fn coalesce_delay(mut self, delay: Duration) -> Self {
        self.queue.coalesce_delay = delay;
        self
    }

    /// Settling time between one socket closing and the next opening
    /// (default: 100ms).
    pub fn reconnect_guard(mut self, guard: Duration) -> Self {
        self.queue.reconnect_guard = guard;
        self
    }

    /// Replace the polling cadence.
    pub fn poll_config(mut self, config: PollConfig) -> Self {
        self.poll = config;
        self
    }

    /// Enable or disable background status polling (default: enabled).
    ///
    /// Without polling the cached getters only change on acknowledged power
    /// writes and explicit queries.
    pub fn polling(mut self, enabled: bool) -> Self {
        self.polling = enabled;
        self
    }

    /// Capacity of the event broadcast channel (default: 64).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build a [`DenonReceiver`] that talks TCP to the configured address.
    pub async fn build(self) -> Result<DenonReceiver> {
        self.build_with_connector(Arc::new(TcpConnector::new()))
            .await
    }

    /// Build a [`DenonReceiver`] with a caller-provided connector.
    ///
    /// This is the entry point for testing (pass a `MockConnector` from
    /// `avrlib-test-harness`).
    pub async fn build_with_connector(
        self,
        connector: Arc<dyn Connector>,
    ) -> Result<DenonReceiver> {
        self.validate()?;

        let settings = DeviceSettings {
            host: self.host,
            port: self.port,
            power_command: self.power_command,
        };

        let io = Arc::new(spawn_device_io(&settings, self.queue, connector));
        let cache = Arc::new(StatusCache::new(self.event_capacity));

        let poller = if self.polling {
            Some(StatusPoller::spawn(
                Arc::clone(&io),
                settings.power_command,
                self.poll,
                Arc::clone(&cache),
                io.cancel_token().child_token(),
            ))
        } else {
            None
        };

        Ok(DenonReceiver::new(settings, io, cache, poller))
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidParameter("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidParameter("port must not be 0".into()));
        }
        let timings = [
            ("connect timeout", self.queue.connect_timeout),
            ("inactivity timeout", self.queue.inactivity_timeout),
            ("tick interval", self.queue.tick_interval),
        ];
        for (name, value) in timings {
            if value.is_zero() {
                return Err(Error::InvalidParameter(format!("{name} must not be zero")));
            }
        }
        if self.polling && (self.poll.fast_delay.is_zero() || self.poll.slow_delay.is_zero()) {
            return Err(Error::InvalidParameter(
                "poll delays must not be zero".into(),
            ));
        }
        if self.polling && self.poll.failure_ceiling == 0 {
            return Err(Error::InvalidParameter(
                "failure ceiling must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrlib_core::types::PollMode;
    use avrlib_test_harness::{ConnectionScript, MockConnector};

    fn connector() -> Arc<dyn Connector> {
        Arc::new(MockConnector::new())
    }

    #[tokio::test]
    async fn defaults() {
        let avr = DenonBuilder::new(" 192.168.1.40 ")
            .polling(false)
            .build_with_connector(connector())
            .await
            .unwrap();
        let settings = avr.settings();
        assert_eq!(settings.host, "192.168.1.40");
        assert_eq!(settings.port, 23);
        assert_eq!(settings.power_command, PowerCommand::Pw);
    }

    #[tokio::test]
    async fn empty_host_rejected() {
        let result = DenonBuilder::new("  ")
            .build_with_connector(connector())
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn zero_timeouts_rejected() {
        let result = DenonBuilder::new("avr.local")
            .connect_timeout(Duration::ZERO)
            .build_with_connector(connector())
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));

        let result = DenonBuilder::new("avr.local")
            .inactivity_timeout(Duration::ZERO)
            .build_with_connector(connector())
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn zero_poll_delay_rejected_only_when_polling() {
        let config = PollConfig {
            fast_delay: Duration::ZERO,
            ..PollConfig::default()
        };
        let result = DenonBuilder::new("avr.local")
            .poll_config(config.clone())
            .build_with_connector(connector())
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));

        let result = DenonBuilder::new("avr.local")
            .poll_config(config)
            .polling(false)
            .build_with_connector(connector())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_port_reaches_connector() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MUON\r"));
        let avr = DenonBuilder::new("10.0.0.5")
            .port(2323)
            .polling(false)
            .build_with_connector(Arc::new(mock.clone()))
            .await
            .unwrap();

        avr.set_mute(true).await.unwrap();
        assert_eq!(mock.connect_addrs(), vec!["10.0.0.5:2323".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_starts_fast() {
        let avr = DenonBuilder::new("avr.local")
            .build_with_connector(connector())
            .await
            .unwrap();
        assert_eq!(avr.poll_mode(), Some(PollMode::Fast));
    }
}
