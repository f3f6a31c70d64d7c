//! Message parsing.
//!
//! Parsing is deliberately permissive: any payload yields a [`Message`].
//! A payload without the delimiter is attributed to [`DEFAULT_SENDER`].

use std::fmt;

/// Token separating sender from body on the wire.
pub const DEFAULT_DELIMITER: &str = "|x|";

/// Sender used when the payload carries no delimiter.
pub const DEFAULT_SENDER: &str = "root";

/// Maximum number of bytes read from one connection.
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// A parsed notification message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub body: String,
}

impl Message {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }

    /// Encodes the message in wire form, newline terminated.
    pub fn encode(&self, delimiter: &str) -> Vec<u8> {
        format!("{}{}{}\n", self.sender, delimiter, self.body).into_bytes()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sender, self.body)
    }
}

/// Parses a raw payload using [`DEFAULT_DELIMITER`].
pub fn parse(raw: &[u8]) -> Message {
    parse_with(raw, DEFAULT_DELIMITER)
}

/// Parses a raw payload split on `delimiter`.
///
/// Trailing `\r` / `\n` are stripped first. Parts beyond the second are
/// ignored. An empty delimiter never matches.
pub fn parse_with(raw: &[u8], delimiter: &str) -> Message {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);

    if delimiter.is_empty() {
        return Message::new(DEFAULT_SENDER, text);
    }

    let mut parts = text.split(delimiter);
    match (parts.next(), parts.next()) {
        (Some(sender), Some(body)) => Message::new(sender, body),
        _ => Message::new(DEFAULT_SENDER, text),
    }
}
