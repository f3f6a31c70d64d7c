//! Connection handler for individual sender connections.
//!
//! Each accepted connection carries at most one message. The handler:
//! - Reads up to [`MAX_MESSAGE_SIZE`] bytes, stopping at the first newline or EOF
//! - Parses the payload into sender and body
//! - Hands the notification to the notifier as separately tracked work
//! - Closes the connection on every exit path (the stream is owned and dropped)
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Read errors and timeouts are logged and end only this connection
//!
//! A handler still waiting for its payload when the daemon shuts down gives
//! up at once instead of holding the shutdown for the read timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rino_core::Tag;
use rino_protocol::{parse_with, MAX_MESSAGE_SIZE};

use crate::notifier::{dispatch, Notification, Notifier};
use crate::work::InFlightWork;

/// Everything a handler needs besides its connection. Shared by all links.
#[derive(Clone)]
pub struct HandlerContext {
    /// Notifier receiving parsed messages
    pub notifier: Arc<dyn Notifier>,

    /// Tracker for the notifier dispatch spawned per message
    pub work: InFlightWork,

    /// Upper bound on the wait for a sender's payload
    pub read_timeout: Duration,

    /// Token separating sender from body
    pub delimiter: Arc<str>,

    /// Cancelled at shutdown; abandons reads that have not completed
    pub shutdown: CancellationToken,
}

/// Handles one accepted connection.
pub struct ConnectionHandler<S> {
    stream: S,
    peer: SocketAddr,
    tag: Tag,
    context: HandlerContext,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr, tag: Tag, context: HandlerContext) -> Self {
        Self {
            stream,
            peer,
            tag,
            context,
        }
    }

    /// Runs the handler to completion.
    ///
    /// Returns the notification that was dispatched, if any. The connection
    /// is closed before the notifier runs.
    pub async fn run(self) -> Option<Notification> {
        let Self {
            stream,
            peer,
            tag,
            context,
        } = self;
        debug!(tag = %tag, peer = %peer, "Handling connection");

        // The stream is consumed here and dropped (closed) on return
        let read = tokio::select! {
            biased;

            result = read_message(stream, context.read_timeout) => result,

            () = context.shutdown.cancelled() => {
                debug!(tag = %tag, peer = %peer, "Shutting down, abandoning read");
                return None;
            }
        };

        let raw = match read {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(tag = %tag, peer = %peer, "Connection closed without a message");
                return None;
            }
            Err(e) => {
                warn!(tag = %tag, peer = %peer, error = %e, "Failed to read message");
                return None;
            }
        };

        let message = parse_with(&raw, &context.delimiter);
        info!(
            tag = %tag,
            peer = %peer,
            sender = %message.sender,
            bytes = raw.len(),
            "Message received"
        );

        let notification = Notification::new(tag, message);
        dispatch(
            &context.work,
            Arc::clone(&context.notifier),
            notification.clone(),
        );
        Some(notification)
    }
}

/// Reads one message: up to [`MAX_MESSAGE_SIZE`] bytes, through the first
/// newline or until EOF, bounded by `read_timeout`.
///
/// Returns `Ok(None)` when the peer sent nothing.
async fn read_message<S>(stream: S, read_timeout: Duration) -> Result<Option<Vec<u8>>, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream.take(MAX_MESSAGE_SIZE as u64));
    let mut buf = Vec::with_capacity(256);

    let result = timeout(read_timeout, reader.read_until(b'\n', &mut buf)).await;
    match result {
        Ok(Ok(0)) => Ok(None),
        Ok(Ok(_)) => Ok(Some(buf)),
        // A partial payload before a reset is still worth showing
        Ok(Err(_)) if !buf.is_empty() => Ok(Some(buf)),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::Timeout(read_timeout)),
    }
}

/// Errors that can occur while reading a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("No message within {0:?}")]
    Timeout(Duration),
}
