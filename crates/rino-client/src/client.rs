//! One-shot sender for link ports.
//!
//! A send is one TCP connection: connect, write `SENDER|x|BODY\n`, shut the
//! write half down, close. The daemon never answers.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use rino_protocol::{Message, DEFAULT_DELIMITER, MAX_MESSAGE_SIZE};

use crate::error::{ClientError, Result};

/// Default bound for connecting and for writing.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how to send.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Link port, usually on loopback
    pub addr: SocketAddr,

    /// Token separating sender from body; must match the daemon's
    pub delimiter: String,

    /// Applied separately to connect and to write
    pub timeout: Duration,
}

impl SendOptions {
    /// Options for `port` on 127.0.0.1 with default delimiter and timeout.
    pub fn new(port: u16) -> Self {
        Self::with_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            delimiter: DEFAULT_DELIMITER.to_string(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Sends `message` and returns the number of bytes written.
///
/// Messages that would not fit in one daemon read are refused rather than
/// silently truncated on the other side.
pub async fn send_message(options: &SendOptions, message: &Message) -> Result<usize> {
    let payload = message.encode(&options.delimiter);
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ClientError::TooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let addr = options.addr;
    let timed_out = |_| ClientError::Timeout {
        addr,
        after: options.timeout,
    };

    let mut stream = timeout(options.timeout, TcpStream::connect(addr))
        .await
        .map_err(timed_out)?
        .map_err(|error| ClientError::Connect { addr, error })?;
    debug!(addr = %addr, "Connected");

    let write = async {
        stream.write_all(&payload).await?;
        stream.shutdown().await
    };
    timeout(options.timeout, write)
        .await
        .map_err(timed_out)?
        .map_err(|error| ClientError::Write { addr, error })?;

    debug!(addr = %addr, bytes = payload.len(), sender = %message.sender, "Message sent");
    Ok(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = SendOptions::new(9001);
        assert_eq!(options.addr, SocketAddr::from(([127, 0, 0, 1], 9001)));
        assert_eq!(options.delimiter, "|x|");
        assert_eq!(options.timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_oversized_message_refused_before_connect() {
        // Port 1 is never a rino link; the size check must fire first
        let options = SendOptions::new(1);
        let message = Message::new("alice", "x".repeat(MAX_MESSAGE_SIZE));
        match send_message(&options, &message).await {
            Err(ClientError::TooLarge { max, .. }) => assert_eq!(max, MAX_MESSAGE_SIZE),
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }
}
