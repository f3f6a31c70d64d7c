//! Multi-link TCP server for the rino daemon.
//!
//! The server:
//! - Binds one listener per configured link before starting any of them
//! - Runs every link's accept loop concurrently
//! - Spawns a ConnectionHandler per accepted connection
//! - Shuts all links down together and drains in-flight work
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Supervisor                       │
//! │                                                      │
//! │   Link "CI" :9001      Link "BOX" :9002     ...      │
//! │   (accept loop)        (accept loop)                 │
//! └──────┬──────────────────────┬────────────────────────┘
//!        │ accept()             │ accept()
//!        ▼                      ▼
//! ┌─────────────────┐   ┌─────────────────┐
//! │ConnectionHandler│   │ConnectionHandler│   one per connection
//! └───────┬─────────┘   └───────┬─────────┘
//!         │ dispatch            │ dispatch
//!         ▼                     ▼
//! ┌──────────────────────────────────────────┐
//! │            Notifier (command)            │
//! └──────────────────────────────────────────┘
//!
//! every box below the supervisor is a unit of InFlightWork
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Per-connection and shutdown-path errors are logged, never propagated

mod connection;
mod link;

pub use connection::{ConnectionError, ConnectionHandler, HandlerContext};
pub use link::{
    Accept, BoundListener, Link, LinkControl, LinkError, LinkOutcome, LinkState,
    SENTINEL_PAYLOAD, SENTINEL_TIMEOUT,
};

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rino_core::{LinkSet, Tag};
use rino_protocol::DEFAULT_DELIMITER;

use crate::notifier::Notifier;
use crate::work::InFlightWork;

/// Default upper bound on waiting for a sender's payload.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings shared by every link of a supervisor.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_address: IpAddr,
    pub read_timeout: Duration,
    pub delimiter: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            read_timeout: DEFAULT_READ_TIMEOUT,
            delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }
}

/// Result of a full shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub links: Vec<(Tag, LinkOutcome)>,
}

impl ShutdownReport {
    /// True when every link stopped on request.
    pub fn is_clean(&self) -> bool {
        self.links
            .iter()
            .all(|(_, outcome)| *outcome == LinkOutcome::Clean)
    }
}

/// Owns every link of a daemon and coordinates their shutdown.
///
/// The link set is fixed at [`start`](Self::start) and read-only afterwards.
pub struct Supervisor {
    links: Vec<LinkControl>,
    work: InFlightWork,
    closing: CancellationToken,
    stopping: AtomicBool,
    shutdown: OnceCell<ShutdownReport>,
}

impl Supervisor {
    /// Binds every link in `links` without a runtime.
    ///
    /// Either every port is bound or none is: on the first failure the
    /// listeners bound so far are dropped and the error is returned.
    pub fn bind_all(links: &LinkSet, bind_address: IpAddr) -> Result<Vec<BoundListener>, ServerError> {
        links
            .into_iter()
            .map(|spec| BoundListener::bind(spec, bind_address).map_err(ServerError::from))
            .collect()
    }

    /// Binds and starts every link in `links`.
    ///
    /// All listeners are bound before any accept loop runs. If one bind
    /// fails, the listeners bound so far are released and the error is
    /// returned with nothing left running.
    pub async fn start(
        links: &LinkSet,
        options: ServerOptions,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ServerError> {
        let bound = Self::bind_all(links, options.bind_address)?;
        Self::start_bound(bound, options, notifier).await
    }

    /// Starts links from ports bound earlier with [`bind_all`](Self::bind_all).
    pub async fn start_bound(
        bound: Vec<BoundListener>,
        options: ServerOptions,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ServerError> {
        let mut links = Vec::with_capacity(bound.len());
        for listener in bound {
            links.push(Link::from_bound(listener).await?);
        }
        Ok(Self::launch(links, options, notifier))
    }

    /// Runs the accept loops of already built links.
    ///
    /// `options.bind_address` is unused here; the links are bound.
    pub fn launch(links: Vec<Link>, options: ServerOptions, notifier: Arc<dyn Notifier>) -> Self {
        let work = InFlightWork::new();
        let closing = CancellationToken::new();
        let context = HandlerContext {
            notifier,
            work: work.clone(),
            read_timeout: options.read_timeout,
            delimiter: Arc::from(options.delimiter.as_str()),
            shutdown: closing.clone(),
        };

        let controls: Vec<LinkControl> = links.iter().map(Link::control).collect();
        let tags: Vec<&str> = controls.iter().map(|l| l.tag().as_str()).collect();
        info!(links = ?tags, count = controls.len(), "Supervisor started");

        for link in links {
            // The loop records its own outcome on the link
            work.spawn(link.run(context.clone()));
        }

        Self {
            links: controls,
            work,
            closing,
            stopping: AtomicBool::new(false),
            shutdown: OnceCell::new(),
        }
    }

    /// Links in configuration order.
    pub fn links(&self) -> &[LinkControl] {
        &self.links
    }

    /// Looks up a link by tag.
    pub fn link(&self, tag: &str) -> Option<&LinkControl> {
        self.links.iter().find(|l| l.tag().as_str() == tag)
    }

    /// The in-flight work tracker shared by all links.
    pub fn work(&self) -> &InFlightWork {
        &self.work
    }

    /// Returns true once shutdown has begun.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Runs until `shutdown` resolves or every link has closed on its own,
    /// then stops everything and drains.
    pub async fn run_until<F>(&self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            () = shutdown => info!("Shutdown requested"),
            () = self.all_links_closed() => warn!("Every link has closed, shutting down"),
        }
        self.stop_all().await
    }

    /// Stops every link concurrently and waits until no work is in flight.
    ///
    /// Safe to call any number of times, from any number of tasks: the
    /// first call performs the shutdown, every other call waits for it and
    /// returns the same report.
    pub async fn stop_all(&self) -> ShutdownReport {
        if self.shutdown.initialized() || self.is_stopping() {
            debug!("Shutdown already in progress");
        }
        self.shutdown
            .get_or_init(|| self.shutdown_once())
            .await
            .clone()
    }

    async fn shutdown_once(&self) -> ShutdownReport {
        self.stopping.store(true, Ordering::Release);
        info!(links = self.links.len(), in_flight = self.work.len(), "Stopping all links");

        // Stops are independent; one slow sentinel dial must not delay the rest
        let mut stops = JoinSet::new();
        for link in &self.links {
            let link = link.clone();
            stops.spawn(async move { link.stop().await });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Link stop task failed");
            }
        }

        // Handlers still waiting on a silent peer give up now
        self.closing.cancel();

        self.work.close();
        debug!(in_flight = self.work.len(), "Waiting for in-flight work");
        self.work.drained().await;

        let outcomes = self
            .links
            .iter()
            .map(|link| {
                let outcome = link.outcome().unwrap_or_else(|| {
                    LinkOutcome::Aborted("accept loop ended without reporting".to_string())
                });
                (link.tag().clone(), outcome)
            })
            .collect();

        info!("All links stopped, in-flight work drained");
        ShutdownReport { links: outcomes }
    }

    async fn all_links_closed(&self) {
        for link in &self.links {
            link.closed().await;
        }
    }
}

/// Errors that can occur starting the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Link(#[from] LinkError),
}
