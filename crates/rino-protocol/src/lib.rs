//! rino protocol - Wire format for notification messages
//!
//! One message per TCP connection, formatted as `SENDER|x|BODY` or just
//! `BODY`, optionally terminated by a newline. There is no length prefix
//! and no framing beyond the connection itself.

pub mod message;
pub mod url;

pub use message::{parse, parse_with, Message, DEFAULT_DELIMITER, DEFAULT_SENDER, MAX_MESSAGE_SIZE};
pub use url::extract_url;
