//! Core types used throughout avrlib.
//!
//! These types describe a networked audio/video receiver independently of
//! the command queue that talks to it: where it lives, which power command
//! dialect it speaks, and the last capability values read from it.

use std::fmt;
use std::str::FromStr;

/// The fixed TCP port of the receiver's telnet control listener.
pub const TELNET_PORT: u16 = 23;

/// Power command dialect spoken by a receiver.
///
/// Most receivers switch the whole unit with `PWON` / `PWSTANDBY`. Some
/// models only react to the main-zone command, `ZMON` / `ZMOFF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerCommand {
    /// `PW` prefix, `STANDBY` as the off keyword.
    #[default]
    Pw,
    /// `ZM` prefix, `OFF` as the off keyword.
    Zm,
}

impl PowerCommand {
    /// The command prefix (`"PW"` or `"ZM"`).
    pub fn prefix(&self) -> &'static str {
        match self {
            PowerCommand::Pw => "PW",
            PowerCommand::Zm => "ZM",
        }
    }

    /// The keyword that follows the prefix to switch the receiver off.
    pub fn off_keyword(&self) -> &'static str {
        match self {
            PowerCommand::Pw => "STANDBY",
            PowerCommand::Zm => "OFF",
        }
    }
}

impl fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Error returned when a string cannot be parsed into a [`PowerCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePowerCommandError(String);

impl fmt::Display for ParsePowerCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown power command prefix: {}", self.0)
    }
}

impl std::error::Error for ParsePowerCommandError {}

impl FromStr for PowerCommand {
    type Err = ParsePowerCommandError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PW" => Ok(PowerCommand::Pw),
            "ZM" => Ok(PowerCommand::Zm),
            _ => Err(ParsePowerCommandError(s.to_string())),
        }
    }
}

/// Immutable per-device settings snapshot.
///
/// Captured once when a device is built and handed to its command queue
/// and poller. Changing the address or power dialect means building a new
/// device; nothing reads live settings mid-flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    /// Receiver host name or IP address.
    pub host: String,
    /// Telnet port, [`TELNET_PORT`] unless overridden for testing.
    pub port: u16,
    /// Power command dialect.
    pub power_command: PowerCommand,
}

impl DeviceSettings {
    /// Settings for `host` on the standard telnet port with the `PW` dialect.
    pub fn new(host: impl Into<String>) -> Self {
        DeviceSettings {
            host: host.into(),
            port: TELNET_PORT,
            power_command: PowerCommand::default(),
        }
    }

    /// The `host:port` string used to open connections.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How a queued request uses its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMode {
    /// Send the command, close the socket once the bytes are flushed.
    WriteClose,
    /// Send the command, present the coalesced reply, keep the socket open
    /// until the caller releases it.
    ReadHold,
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestMode::WriteClose => write!(f, "write-close"),
            RequestMode::ReadHold => write!(f, "read-hold"),
        }
    }
}

/// Status polling cadence, chosen by recent failure history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PollMode {
    /// Normal cadence.
    #[default]
    Fast,
    /// Degraded cadence after a full streak of failed cycles.
    Slow,
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollMode::Fast => write!(f, "fast"),
            PollMode::Slow => write!(f, "slow"),
        }
    }
}

/// Last successfully parsed capability values of a receiver.
///
/// Every field is `None` until the first successful read. A failed or
/// unparsable reply never overwrites a value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiverState {
    /// `true` when the receiver is on.
    pub power: Option<bool>,
    /// `true` when the main zone is muted.
    pub muted: Option<bool>,
    /// Master volume normalised to `0.0..=1.0`.
    pub volume: Option<f32>,
    /// Current input source label with the `SI` prefix stripped
    /// (e.g. `"TUNER"`, `"BD"`).
    pub source: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_command_keywords() {
        assert_eq!(PowerCommand::Pw.prefix(), "PW");
        assert_eq!(PowerCommand::Pw.off_keyword(), "STANDBY");
        assert_eq!(PowerCommand::Zm.prefix(), "ZM");
        assert_eq!(PowerCommand::Zm.off_keyword(), "OFF");
    }

    #[test]
    fn power_command_default_is_pw() {
        assert_eq!(PowerCommand::default(), PowerCommand::Pw);
    }

    #[test]
    fn power_command_from_str() {
        assert_eq!("PW".parse::<PowerCommand>().unwrap(), PowerCommand::Pw);
        assert_eq!("zm".parse::<PowerCommand>().unwrap(), PowerCommand::Zm);
        assert_eq!(" ZM ".parse::<PowerCommand>().unwrap(), PowerCommand::Zm);
        assert!("Z2".parse::<PowerCommand>().is_err());
    }

    #[test]
    fn parse_power_command_error_display() {
        let err = "XX".parse::<PowerCommand>().unwrap_err();
        assert_eq!(err.to_string(), "unknown power command prefix: XX");
    }

    #[test]
    fn device_settings_defaults() {
        let settings = DeviceSettings::new("192.168.1.40");
        assert_eq!(settings.port, TELNET_PORT);
        assert_eq!(settings.power_command, PowerCommand::Pw);
        assert_eq!(settings.addr(), "192.168.1.40:23");
    }

    #[test]
    fn request_mode_display() {
        assert_eq!(RequestMode::WriteClose.to_string(), "write-close");
        assert_eq!(RequestMode::ReadHold.to_string(), "read-hold");
    }

    #[test]
    fn receiver_state_starts_unknown() {
        let state = ReceiverState::default();
        assert!(state.power.is_none());
        assert!(state.muted.is_none());
        assert!(state.volume.is_none());
        assert!(state.source.is_none());
    }
}
