//! Denon/Marantz telnet command builders and reply parsers.
//!
//! All functions are pure: builders produce the command text (framing with
//! the trailing CR is done by the command queue), parsers consume a single
//! reply message as picked out by the matching [`ResponseMatcher`].
//!
//! # Volume encoding
//!
//! Master volume travels as `MV` followed by either two digits (whole dB,
//! `MV45` = 45.0 dB) or three digits (half-dB steps, `MV455` = 45.5 dB).
//! Internally volume is kept in tenths of a dB, `0..=980`, which is the
//! three-digit form. The normalised `0.0..=1.0` level used by callers maps
//! linearly onto that range with 98.0 dB as the ceiling.

use avrlib_core::{Error, PowerCommand, Result};
use avrlib_text_io::ResponseMatcher;

/// Highest volume in tenths of a dB (98.0 dB).
pub const VOLUME_MAX_UNITS: u16 = 980;

/// Line that follows volume replies and must not be taken for the volume.
pub const VOLUME_MAX_PREFIX: &str = "MVMAX";

// ---------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------

/// Build a power query (`PW?` or `ZM?`).
pub fn cmd_query_power(dialect: PowerCommand) -> String {
    format!("{}?", dialect.prefix())
}

/// Build a power command: `PWON` / `PWSTANDBY`, or `ZMON` / `ZMOFF`.
pub fn cmd_set_power(dialect: PowerCommand, on: bool) -> String {
    let keyword = if on { "ON" } else { dialect.off_keyword() };
    format!("{}{}", dialect.prefix(), keyword)
}

/// Build a mute query (`MU?`).
pub fn cmd_query_mute() -> String {
    "MU?".to_string()
}

/// Build a mute command (`MUON` / `MUOFF`).
pub fn cmd_set_mute(muted: bool) -> String {
    let keyword = if muted { "ON" } else { "OFF" };
    format!("MU{keyword}")
}

/// Build a volume query (`MV?`).
pub fn cmd_query_volume() -> String {
    "MV?".to_string()
}

/// Build an absolute volume command from a normalised level.
///
/// The level is clamped to `0.0..=1.0` and scaled onto `0..=980`, always
/// sent with three digits: `0.5` becomes `MV490`.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if `level` is NaN or infinite.
pub fn cmd_set_volume(level: f32) -> Result<String> {
    Ok(cmd_set_volume_units(volume_level_to_units(level)?))
}

/// Build an absolute volume command in tenths of a dB (`MV{units:03}`).
///
/// Values above 980 are clamped.
pub fn cmd_set_volume_units(units: u16) -> String {
    format!("MV{:03}", units.min(VOLUME_MAX_UNITS))
}

/// Build an absolute volume command in dB, e.g. `45.5` becomes `MV455`.
///
/// Values are snapped to the receiver's half-dB steps.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if `db` is NaN or infinite.
pub fn cmd_set_volume_db(db: f32) -> Result<String> {
    if !db.is_finite() {
        return Err(Error::InvalidParameter(format!("volume {db} dB is not a number")));
    }
    let units = half_db_units(db).clamp(0.0, VOLUME_MAX_UNITS as f32) as u16;
    Ok(cmd_set_volume_units(units))
}

/// Build a volume step command (`MVUP` / `MVDOWN`).
pub fn cmd_volume_step(up: bool) -> String {
    let step = if up { "UP" } else { "DOWN" };
    format!("MV{step}")
}

/// Build a source query (`SI?`).
pub fn cmd_query_source() -> String {
    "SI?".to_string()
}

/// Build a source select command (`SI<token>`), e.g. `SIBD`.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if the token is empty or contains
/// characters that would break framing.
pub fn cmd_set_source(token: &str) -> Result<String> {
    validate_command_text(token)?;
    if token.is_empty() || token == "?" {
        return Err(Error::InvalidParameter(format!(
            "invalid source token: {token:?}"
        )));
    }
    Ok(format!("SI{token}"))
}

/// Check that free-form command text is printable ASCII without a CR.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] describing the offending text.
pub fn validate_command_text(command: &str) -> Result<()> {
    if command.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "command must be printable ASCII: {command:?}"
        )))
    }
}

// ---------------------------------------------------------------
// Reply matchers
// ---------------------------------------------------------------

/// Matcher for power replies in the given dialect.
pub fn power_matcher(dialect: PowerCommand) -> ResponseMatcher {
    ResponseMatcher::prefix(dialect.prefix())
}

/// Matcher for mute replies.
pub fn mute_matcher() -> ResponseMatcher {
    ResponseMatcher::prefix("MU")
}

/// Matcher for volume replies, skipping the `MVMAX` line.
pub fn volume_matcher() -> ResponseMatcher {
    ResponseMatcher::prefix("MV").excluding(VOLUME_MAX_PREFIX)
}

/// Matcher for source replies.
pub fn source_matcher() -> ResponseMatcher {
    ResponseMatcher::prefix("SI")
}

// ---------------------------------------------------------------
// Reply parsers
// ---------------------------------------------------------------

/// Parse a power reply (`PWON`, `PWSTANDBY`, `ZMON`, `ZMOFF`).
///
/// # Errors
///
/// Returns [`Error::Unparsable`] if the reply is neither the on nor the
/// off keyword of the dialect.
pub fn parse_power_response(message: &str, dialect: PowerCommand) -> Result<bool> {
    match message.strip_prefix(dialect.prefix()) {
        Some("ON") => Ok(true),
        Some(kw) if kw == dialect.off_keyword() => Ok(false),
        _ => Err(Error::Unparsable(format!("power reply: {message:?}"))),
    }
}

/// Parse a mute reply (`MUON` / `MUOFF`).
///
/// # Errors
///
/// Returns [`Error::Unparsable`] for anything else.
pub fn parse_mute_response(message: &str) -> Result<bool> {
    match message {
        "MUON" => Ok(true),
        "MUOFF" => Ok(false),
        _ => Err(Error::Unparsable(format!("mute reply: {message:?}"))),
    }
}

/// Parse a volume reply into tenths of a dB.
///
/// Two-digit replies are whole dB and scaled by ten; three-digit replies
/// are already in half-dB steps. The result is clamped to 980.
///
/// # Errors
///
/// Returns [`Error::Unparsable`] if the digits are missing or malformed.
pub fn parse_volume_response(message: &str) -> Result<u16> {
    let digits = message
        .strip_prefix("MV")
        .filter(|d| !d.starts_with("MAX"))
        .ok_or_else(|| Error::Unparsable(format!("volume reply: {message:?}")))?;

    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Unparsable(format!("volume digits: {message:?}")));
    }
    let value: u16 = digits
        .parse()
        .map_err(|_| Error::Unparsable(format!("volume digits: {message:?}")))?;

    let units = match digits.len() {
        2 => value * 10,
        3 => value,
        _ => {
            return Err(Error::Unparsable(format!(
                "expected 2 or 3 volume digits: {message:?}"
            )));
        }
    };
    Ok(units.min(VOLUME_MAX_UNITS))
}

/// Parse a source reply (`SI<token>`) into the bare token.
///
/// # Errors
///
/// Returns [`Error::Unparsable`] if the prefix or token is missing.
pub fn parse_source_response(message: &str) -> Result<String> {
    match message.strip_prefix("SI") {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(Error::Unparsable(format!("source reply: {message:?}"))),
    }
}

// ---------------------------------------------------------------
// Volume conversions
// ---------------------------------------------------------------

/// Convert a normalised level to tenths of a dB, clamping to `0.0..=1.0`.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if `level` is NaN or infinite.
pub fn volume_level_to_units(level: f32) -> Result<u16> {
    if !level.is_finite() {
        return Err(Error::InvalidParameter(format!(
            "volume level {level} is not a number"
        )));
    }
    Ok((level.clamp(0.0, 1.0) * VOLUME_MAX_UNITS as f32).round() as u16)
}

/// Convert tenths of a dB to a normalised level.
pub fn volume_units_to_level(units: u16) -> f32 {
    f32::from(units.min(VOLUME_MAX_UNITS)) / f32::from(VOLUME_MAX_UNITS)
}

/// Apply a relative change in dB to a volume in tenths of a dB.
///
/// The change is snapped to half-dB steps; the result never goes below
/// zero or above 980.
pub fn adjust_volume_units(current: u16, delta_db: f32) -> u16 {
    let target = f32::from(current) + half_db_units(delta_db);
    target.clamp(0.0, VOLUME_MAX_UNITS as f32) as u16
}

/// dB to tenths of a dB, rounded to the nearest half dB.
fn half_db_units(db: f32) -> f32 {
    (db * 2.0).round() * 5.0
}
