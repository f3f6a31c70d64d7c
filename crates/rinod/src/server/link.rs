//! A link: one tagged TCP listener and its accept loop.
//!
//! ```text
//! Created ──run──▶ Listening ──stop──▶ Stopping ──loop exits──▶ Closed
//! ```
//!
//! A link is `Created` once its port is bound and `Listening` once its
//! accept loop runs. Ports can be bound before any runtime exists
//! ([`BoundListener`]), so a daemon can fail on a taken port before it forks.
//!
//! # Stopping a parked accept
//!
//! The accept loop spends nearly all of its life parked in `accept()`.
//! [`LinkControl::stop`] unparks it in three steps:
//!
//! 1. set the `stop_requested` flag,
//! 2. close the listener (the loop selects on a close signal and drops it),
//! 3. dial the link's own port on loopback and write [`SENTINEL_PAYLOAD`].
//!
//! Step 3 is there because listener close alone does not interrupt a pending
//! accept on every networking stack. The sentinel connection makes accept
//! return at least once; the loop checks `stop_requested` right after every
//! accept and drops whatever it got without handling it. The same check means
//! a client racing the stop is never handled either.

use std::io::{self, ErrorKind};
use std::net::{self, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rino_core::{LinkSpec, Tag};

use super::connection::{ConnectionHandler, HandlerContext};

/// Payload written by the sentinel dial. Never parsed: the loop drops the
/// connection once it sees `stop_requested`.
pub const SENTINEL_PAYLOAD: &[u8] = b"rino:stop\n";

/// Upper bound for connecting and writing the sentinel.
pub const SENTINEL_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    Listening,
    Stopping,
    Closed,
}

/// How a link's accept loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Stopped on request
    Clean,
    /// Loop ended on a fatal accept error
    Failed(String),
    /// Loop panicked or was dropped before finishing
    Aborted(String),
}

/// Errors that can occur in a link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Failed to bind link {tag} on {addr}: {error}")]
    Bind {
        tag: Tag,
        addr: SocketAddr,
        error: String,
    },

    #[error("Link {tag} stopped accepting: {error}")]
    Accept { tag: Tag, error: String },

    #[error("Sentinel dial to link {tag} at {addr} failed: {error}")]
    Sentinel {
        tag: Tag,
        addr: SocketAddr,
        kind: ErrorKind,
        error: String,
    },
}

/// State shared between a link's accept loop and its controls.
#[derive(Debug)]
struct LinkShared {
    tag: Tag,
    local_addr: SocketAddr,
    stop_requested: AtomicBool,
    stop_issued: AtomicBool,
    sentinel_sent: AtomicBool,
    close: CancellationToken,
    state: watch::Sender<LinkState>,
    outcome: OnceLock<LinkOutcome>,
}

impl LinkShared {
    fn new(tag: Tag, local_addr: SocketAddr) -> Self {
        let (state, _) = watch::channel(LinkState::Created);
        Self {
            tag,
            local_addr,
            stop_requested: AtomicBool::new(false),
            stop_issued: AtomicBool::new(false),
            sentinel_sent: AtomicBool::new(false),
            close: CancellationToken::new(),
            state,
            outcome: OnceLock::new(),
        }
    }
}

// ============================================================================
// Accept source
// ============================================================================

/// Source of incoming connections for a link.
///
/// Implemented for [`TcpListener`]; other implementations let a link be
/// driven by a scripted sequence of accept results.
#[async_trait]
pub trait Accept: Send + 'static {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

// ============================================================================
// Bound listener
// ============================================================================

/// A link port bound without a runtime.
///
/// Binding happens in the calling thread, so it can run before the process
/// daemonizes. [`Link::from_bound`] hands the socket to tokio later.
#[derive(Debug)]
pub struct BoundListener {
    tag: Tag,
    listener: net::TcpListener,
    local_addr: SocketAddr,
}

impl BoundListener {
    /// Binds the port for `spec` on `bind_address`.
    pub fn bind(spec: &LinkSpec, bind_address: IpAddr) -> Result<Self, LinkError> {
        let requested = SocketAddr::new(bind_address, spec.port);
        let bind_err = |error: io::Error| LinkError::Bind {
            tag: spec.tag.clone(),
            addr: requested,
            error: error.to_string(),
        };

        let listener = net::TcpListener::bind(requested).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        debug!(tag = %spec.tag, addr = %local_addr, "Link port bound");

        Ok(Self {
            tag: spec.tag.clone(),
            listener,
            local_addr,
        })
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// ============================================================================
// Link
// ============================================================================

/// A bound link, ready to run its accept loop.
///
/// Owns its accept source exclusively; [`run`](Self::run) consumes it.
pub struct Link {
    acceptor: Box<dyn Accept>,
    shared: Arc<LinkShared>,
}

impl Link {
    /// Binds the listener for `spec` on `bind_address`.
    pub async fn bind(spec: &LinkSpec, bind_address: IpAddr) -> Result<Self, LinkError> {
        Self::from_bound(BoundListener::bind(spec, bind_address)?).await
    }

    /// Registers a port bound earlier with the current runtime.
    pub async fn from_bound(bound: BoundListener) -> Result<Self, LinkError> {
        let BoundListener {
            tag,
            listener,
            local_addr,
        } = bound;
        let listener = TcpListener::from_std(listener).map_err(|e| LinkError::Bind {
            tag: tag.clone(),
            addr: local_addr,
            error: e.to_string(),
        })?;
        Ok(Self::from_acceptor(tag, local_addr, listener))
    }

    /// Builds a link around any accept source.
    ///
    /// `local_addr` is where the sentinel dial goes when the link is stopped.
    pub fn from_acceptor(tag: Tag, local_addr: SocketAddr, acceptor: impl Accept) -> Self {
        Self {
            acceptor: Box::new(acceptor),
            shared: Arc::new(LinkShared::new(tag, local_addr)),
        }
    }

    pub fn tag(&self) -> &Tag {
        &self.shared.tag
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Returns a control handle for stopping and observing this link.
    pub fn control(&self) -> LinkControl {
        LinkControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the accept loop until the link is stopped or accept fails fatally.
    ///
    /// Each accepted connection is handled by a [`ConnectionHandler`]
    /// spawned as tracked work in `context.work`. The outcome is recorded
    /// on the link before this returns.
    pub async fn run(self, context: HandlerContext) -> Result<(), LinkError> {
        let shared = Arc::clone(&self.shared);
        // Declared before the acceptor so the listener is released first
        let _closed = MarkClosedOnDrop(Arc::clone(&shared));
        let Self { mut acceptor, .. } = self;

        // A stop issued before the loop started leaves the state alone
        shared.state.send_if_modified(|state| {
            let created = *state == LinkState::Created;
            if created {
                *state = LinkState::Listening;
            }
            created
        });
        info!(tag = %shared.tag, addr = %shared.local_addr, "Link listening");

        let result = loop {
            let accepted = tokio::select! {
                biased;

                _ = shared.close.cancelled() => {
                    debug!(tag = %shared.tag, "Listener closed");
                    break Ok(());
                }

                result = acceptor.accept() => result,
            };

            if shared.stop_requested.load(Ordering::Acquire) {
                if let Ok((_, peer)) = &accepted {
                    debug!(tag = %shared.tag, peer = %peer, "Dropping connection accepted after stop");
                }
                break Ok(());
            }

            match accepted {
                Ok((stream, peer)) => {
                    let handler =
                        ConnectionHandler::new(stream, peer, shared.tag.clone(), context.clone());
                    context.work.spawn(handler.run());
                }
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(tag = %shared.tag, error = %e, "Transient accept error");
                }
                Err(e) => {
                    error!(tag = %shared.tag, error = %e, "Accept failed, closing link");
                    break Err(LinkError::Accept {
                        tag: shared.tag.clone(),
                        error: e.to_string(),
                    });
                }
            }
        };

        drop(acceptor);
        let outcome = match &result {
            Ok(()) => LinkOutcome::Clean,
            Err(e) => LinkOutcome::Failed(e.to_string()),
        };
        let _ = shared.outcome.set(outcome);
        info!(tag = %shared.tag, "Link closed");
        result
    }
}

/// Moves a link to `Closed` however its accept loop ends.
///
/// A loop that unwinds or is dropped mid-await records
/// [`LinkOutcome::Aborted`] so observers are never left waiting.
struct MarkClosedOnDrop(Arc<LinkShared>);

impl Drop for MarkClosedOnDrop {
    fn drop(&mut self) {
        let shared = &self.0;
        if shared.outcome.get().is_none() {
            let reason = if std::thread::panicking() {
                "accept loop panicked"
            } else {
                "accept loop dropped before finishing"
            };
            let _ = shared.outcome.set(LinkOutcome::Aborted(reason.to_string()));
            warn!(tag = %shared.tag, reason, "Link aborted");
        }
        shared.state.send_replace(LinkState::Closed);
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("shared", &self.shared).finish()
    }
}

/// Accept errors caused by one misbehaving peer rather than the listener.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

// ============================================================================
// Link control
// ============================================================================

/// Cheap-to-clone handle for stopping and observing a running link.
#[derive(Debug, Clone)]
pub struct LinkControl {
    shared: Arc<LinkShared>,
}

impl LinkControl {
    pub fn tag(&self) -> &Tag {
        &self.shared.tag
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// How the accept loop ended; `None` until the link is closed.
    pub fn outcome(&self) -> Option<LinkOutcome> {
        self.shared.outcome.get().cloned()
    }

    /// Returns true once stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::Acquire)
    }

    /// Stops the link: flag, close, sentinel dial.
    ///
    /// Idempotent; only the first call does anything. Failures are logged,
    /// never returned, so one stuck link cannot hold up the others.
    pub async fn stop(&self) {
        if self.shared.stop_issued.swap(true, Ordering::AcqRel) {
            debug!(tag = %self.shared.tag, "Stop already issued");
            return;
        }

        self.request_stop();
        self.close_listener();

        match self.dial_sentinel().await {
            Ok(()) => debug!(tag = %self.shared.tag, "Sentinel delivered"),
            Err(LinkError::Sentinel { kind, error, .. })
                if matches!(
                    kind,
                    ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionReset
                        | ErrorKind::BrokenPipe
                ) =>
            {
                debug!(tag = %self.shared.tag, error = %error, "Listener already gone, sentinel not needed");
            }
            Err(e) => warn!(tag = %self.shared.tag, error = %e, "Sentinel dial failed"),
        }
    }

    /// Step 1 of [`stop`](Self::stop): mark the link as stopping.
    ///
    /// From here on the accept loop drops anything it accepts.
    pub fn request_stop(&self) {
        if !self.shared.stop_requested.swap(true, Ordering::AcqRel) {
            self.shared.state.send_if_modified(|state| {
                if matches!(*state, LinkState::Created | LinkState::Listening) {
                    *state = LinkState::Stopping;
                    true
                } else {
                    false
                }
            });
            debug!(tag = %self.shared.tag, "Stop requested");
        }
    }

    /// Step 2 of [`stop`](Self::stop): signal the accept loop to drop the
    /// listener.
    pub fn close_listener(&self) {
        self.shared.close.cancel();
    }

    /// Step 3 of [`stop`](Self::stop): connect to the link's own port on
    /// loopback and write the sentinel payload.
    ///
    /// Dials at most once per link; later calls return `Ok(())`.
    pub async fn dial_sentinel(&self) -> Result<(), LinkError> {
        if self.shared.sentinel_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let target = loopback_target(self.shared.local_addr);
        let sentinel_err = |kind: ErrorKind, error: String| LinkError::Sentinel {
            tag: self.shared.tag.clone(),
            addr: target,
            kind,
            error,
        };

        let dial = async {
            let mut stream = TcpStream::connect(target).await?;
            stream.write_all(SENTINEL_PAYLOAD).await?;
            stream.shutdown().await
        };

        match timeout(SENTINEL_TIMEOUT, dial).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(sentinel_err(e.kind(), e.to_string())),
            Err(_) => Err(sentinel_err(
                ErrorKind::TimedOut,
                format!("no connection within {SENTINEL_TIMEOUT:?}"),
            )),
        }
    }

    /// Resolves once the accept loop has exited and released the listener.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail
        let _ = rx.wait_for(|state| *state == LinkState::Closed).await;
    }
}

/// Loopback address reaching a listener bound to `addr`.
///
/// Wildcard binds are reached through loopback of the same family;
/// specific addresses are dialled as they are.
fn loopback_target(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}
