//! Carriage-return framed text protocol.
//!
//! Receivers speak 7-bit ASCII commands, each terminated by a single CR
//! (`0x0D`). A reply may arrive split across several TCP segments, and a
//! single segment may carry several replies back to back, so inbound data
//! is accumulated into a text buffer first and only split into messages
//! once the connection layer decides the reply is complete.

/// The carriage-return byte that terminates every frame.
pub const TERMINATOR: u8 = b'\r';

/// Prefix of the error reply sent by receivers for commands they reject.
pub const ERROR_SENTINEL: &str = "SSINFAI";

/// Encode a command into its wire frame.
///
/// The command text is sent as-is followed by one CR; no escaping is done.
pub fn encode_command(command: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + 1);
    frame.extend_from_slice(command.as_bytes());
    frame.push(TERMINATOR);
    frame
}

/// Append an inbound chunk to a running text buffer.
///
/// Bytes outside ASCII are replaced rather than rejected; the reply
/// parsers only look at ASCII prefixes.
pub fn accumulate(buffer: &mut String, chunk: &[u8]) {
    buffer.push_str(&String::from_utf8_lossy(chunk));
}

/// Split a buffer into its messages, in order.
///
/// Empty fragments (consecutive terminators, or a trailing terminator) are
/// skipped. A trailing fragment without terminator is still returned.
pub fn split_messages(buffer: &str) -> impl Iterator<Item = &str> {
    buffer
        .split(TERMINATOR as char)
        .map(|m| m.trim_matches('\n'))
        .filter(|m| !m.is_empty())
}

/// Describes which message of a multi-message reply answers a command.
///
/// Matching is by prefix, with an exclusion list for unrelated lines that
/// share the prefix: a volume query is answered by `MV455` but commonly
/// followed by `MVMAX 98`, which also starts with `MV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMatcher {
    /// Prefix the answering message starts with.
    pub prefix: String,
    /// Messages starting with any of these are never a match.
    pub exclude: Vec<String>,
}

impl ResponseMatcher {
    /// Match on `prefix` with no exclusions.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        ResponseMatcher {
            prefix: prefix.into(),
            exclude: Vec::new(),
        }
    }

    /// Additionally reject messages starting with `prefix`.
    pub fn excluding(mut self, prefix: impl Into<String>) -> Self {
        self.exclude.push(prefix.into());
        self
    }

    /// `true` if `message` answers this matcher.
    pub fn matches(&self, message: &str) -> bool {
        message.starts_with(&self.prefix)
            && !self.exclude.iter().any(|ex| message.starts_with(ex.as_str()))
    }
}

/// Return the first message in `buffer` accepted by `matcher`.
pub fn extract_by_prefix<'a>(buffer: &'a str, matcher: &ResponseMatcher) -> Option<&'a str> {
    split_messages(buffer).find(|m| matcher.matches(m))
}

/// `true` if the reply starts with the receiver's error sentinel.
pub fn is_error_reply(text: &str) -> bool {
    split_messages(text)
        .next()
        .is_some_and(|first| first.starts_with(ERROR_SENTINEL))
}
