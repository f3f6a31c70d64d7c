//! Error types for the rino sender.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors that can occur while sending a message.
///
/// Most carry the link address, since a refused connection usually means
/// the SSH forward for that port is down.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Nothing is listening on the link port.
    #[error("Failed to connect to {addr}: {error} (is the port forward up?)")]
    Connect { addr: SocketAddr, error: io::Error },

    /// The connection or write did not finish in time.
    #[error("Timed out after {after:?} talking to {addr}")]
    Timeout { addr: SocketAddr, after: Duration },

    /// The connection broke while writing.
    #[error("Failed to send to {addr}: {error}")]
    Write { addr: SocketAddr, error: io::Error },

    /// The encoded message is larger than the daemon reads.
    #[error("Message is {size} bytes, the daemon reads at most {max}")]
    TooLarge { size: usize, max: usize },

    /// Reading the message body from stdin failed.
    #[error("Failed to read message from stdin: {0}")]
    Stdin(#[source] io::Error),
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
