//! Integration tests for the link supervisor.
//!
//! These tests run real TCP listeners on ephemeral loopback ports and verify
//! message delivery, link isolation, and graceful shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use rino_core::{LinkSet, LinkSpec, Tag};
use rinod::notifier::{Notification, Notifier, NotifyError};
use rinod::server::{
    Accept, HandlerContext, Link, LinkError, LinkOutcome, LinkState, ServerError, ServerOptions,
    Supervisor,
};
use rinod::work::InFlightWork;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for anything a test waits on
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between condition checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

/// Notifier that records every notification.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Notification>>,
}

impl Recorder {
    fn seen(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.seen.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Notifier that blocks until the test releases it.
struct Gated {
    entered: AtomicUsize,
    gate: Semaphore,
    done: AtomicUsize,
}

impl Gated {
    fn new() -> Self {
        Self {
            entered: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            done: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Notifier for Gated {
    async fn notify(&self, _notification: &Notification) -> Result<(), NotifyError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await;
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Accept source replaying a fixed list of errors, then parking forever.
struct ScriptedAccept {
    errors: VecDeque<io::Error>,
}

#[async_trait]
impl Accept for ScriptedAccept {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        match self.errors.pop_front() {
            Some(error) => Err(error),
            None => std::future::pending().await,
        }
    }
}

/// A link whose accept fails with "Too many open files" after one
/// transient error.
fn failing_link(tag: &str) -> Link {
    // A port nobody listens on, for the sentinel dial at stop
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let errors = VecDeque::from([
        io::Error::from(ErrorKind::ConnectionAborted),
        io::Error::new(ErrorKind::Other, "Too many open files"),
    ]);
    Link::from_acceptor(Tag::new(tag).unwrap(), addr, ScriptedAccept { errors })
}

fn links(tags: &[&str]) -> LinkSet {
    LinkSet::new(
        tags.iter()
            .map(|tag| LinkSpec::new(Tag::new(*tag).unwrap(), 0))
            .collect(),
    )
    .unwrap()
}

async fn start(tags: &[&str], notifier: Arc<dyn Notifier>) -> Arc<Supervisor> {
    let supervisor = Supervisor::start(&links(tags), ServerOptions::default(), notifier)
        .await
        .expect("start supervisor");
    Arc::new(supervisor)
}

fn addr_of(supervisor: &Supervisor, tag: &str) -> SocketAddr {
    supervisor.link(tag).expect("link exists").local_addr()
}

/// Opens one connection, writes `payload` and closes.
async fn send(addr: SocketAddr, payload: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(payload).await.expect("write");
    stream.shutdown().await.expect("shutdown");
}

/// Polls `condition` until it holds, failing the test after WAIT_TIMEOUT.
async fn wait_until(condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            sleep(POLL_INTERVAL).await;
        }
    };
    timeout(WAIT_TIMEOUT, poll)
        .await
        .expect("condition not met in time");
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_end_to_end_sender_and_body() {
    let recorder = Arc::new(Recorder::default());
    let supervisor = start(&["CI"], recorder.clone()).await;
    let addr = addr_of(&supervisor, "CI");

    send(addr, b"alice|x|build finished\n").await;
    wait_until(|| recorder.seen().len() == 1).await;
    send(addr, b"just a status\n").await;
    wait_until(|| recorder.seen().len() == 2).await;

    let seen = recorder.seen();
    assert_eq!(seen[0].tag.as_str(), "CI");
    assert_eq!(seen[0].sender, "alice");
    assert_eq!(seen[0].body, "build finished");
    assert_eq!(seen[0].title(), "CI: alice");

    assert_eq!(seen[1].tag.as_str(), "CI");
    assert_eq!(seen[1].sender, "root");
    assert_eq!(seen[1].body, "just a status");

    let report = supervisor.stop_all().await;
    assert!(report.is_clean(), "unclean shutdown: {report:?}");
    assert_eq!(recorder.seen().len(), 2);
}

#[tokio::test]
async fn test_links_are_isolated() {
    let recorder = Arc::new(Recorder::default());
    let supervisor = start(&["A", "B"], recorder.clone()).await;
    let addr_a = addr_of(&supervisor, "A");
    let addr_b = addr_of(&supervisor, "B");
    assert_ne!(addr_a.port(), addr_b.port());

    send(addr_a, b"x|x|to a\n").await;
    send(addr_b, b"y|x|to b\n").await;
    send(addr_a, b"z|x|to a again\n").await;
    wait_until(|| recorder.seen().len() == 3).await;

    for notification in recorder.seen() {
        let expected = if notification.body.ends_with("to b") {
            "B"
        } else {
            "A"
        };
        assert_eq!(notification.tag.as_str(), expected, "{notification:?}");
    }

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_empty_connection_is_not_notified() {
    let recorder = Arc::new(Recorder::default());
    let supervisor = start(&["CI"], recorder.clone()).await;
    let addr = addr_of(&supervisor, "CI");

    send(addr, b"").await;
    send(addr, b"after|x|empty\n").await;
    wait_until(|| !recorder.seen().is_empty()).await;

    supervisor.stop_all().await;
    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].sender, "after");
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_stop_all_waits_for_in_flight_notifier() {
    let gated = Arc::new(Gated::new());
    let supervisor = start(&["CI"], gated.clone()).await;

    send(addr_of(&supervisor, "CI"), b"alice|x|slow\n").await;
    wait_until(|| gated.entered.load(Ordering::SeqCst) == 1).await;

    let stopping = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.stop_all().await })
    };

    // Links go down, but the dispatch still holds the drain open
    sleep(Duration::from_millis(200)).await;
    assert!(supervisor.is_stopping());
    assert!(!stopping.is_finished());
    assert_eq!(supervisor.link("CI").unwrap().state(), LinkState::Closed);
    assert_eq!(supervisor.work().len(), 1);

    gated.gate.add_permits(1);
    let report = timeout(WAIT_TIMEOUT, stopping)
        .await
        .expect("stop_all finished")
        .expect("stop_all task");
    assert!(report.is_clean());
    assert_eq!(gated.done.load(Ordering::SeqCst), 1);
    assert!(supervisor.work().is_empty());
}

#[tokio::test]
async fn test_silent_client_does_not_delay_stop_all() {
    let recorder = Arc::new(Recorder::default());
    // Default options: a 30 s read timeout
    let supervisor = start(&["CI"], recorder.clone()).await;

    // Connects and never writes
    let _silent = TcpStream::connect(addr_of(&supervisor, "CI")).await.unwrap();
    wait_until(|| supervisor.work().len() == 2).await;

    let report = timeout(Duration::from_secs(2), supervisor.stop_all())
        .await
        .expect("stop_all held up by a silent client");
    assert!(report.is_clean());
    assert!(supervisor.work().is_empty());
    assert!(recorder.seen().is_empty());
}

#[tokio::test]
async fn test_dropped_stop_all_keeps_full_report() {
    let gated = Arc::new(Gated::new());
    let supervisor = start(&["CI"], gated.clone()).await;

    send(addr_of(&supervisor, "CI"), b"alice|x|slow\n").await;
    wait_until(|| gated.entered.load(Ordering::SeqCst) == 1).await;

    // Abandoned while the drain waits on the notifier
    let abandoned = timeout(Duration::from_millis(100), supervisor.stop_all()).await;
    assert!(abandoned.is_err());

    gated.gate.add_permits(1);
    let report = timeout(WAIT_TIMEOUT, supervisor.stop_all())
        .await
        .expect("stop_all finished");
    assert_eq!(report.links.len(), 1);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_nothing_accepted_after_stop() {
    let recorder = Arc::new(Recorder::default());
    let supervisor = start(&["CI"], recorder.clone()).await;
    let addr = addr_of(&supervisor, "CI");

    supervisor.stop_all().await;

    assert!(TcpStream::connect(addr).await.is_err());
    // The sentinel connection is never handed to the notifier
    assert!(recorder.seen().is_empty());
}

#[tokio::test]
async fn test_double_stop_is_clean() {
    let recorder = Arc::new(Recorder::default());
    let supervisor = start(&["A", "B"], recorder).await;

    let (first, second) = tokio::join!(supervisor.stop_all(), supervisor.stop_all());
    assert_eq!(first, second);
    assert!(first.is_clean());
    assert_eq!(first.links.len(), 2);

    // Stopping again, globally or per link, changes nothing
    let third = supervisor.stop_all().await;
    assert_eq!(third, first);
    for link in supervisor.links() {
        link.stop().await;
        link.stop().await;
        assert_eq!(link.state(), LinkState::Closed);
    }
}

#[tokio::test]
async fn test_wildcard_bind_stops_through_loopback() {
    let recorder = Arc::new(Recorder::default());
    let options = ServerOptions {
        bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        ..ServerOptions::default()
    };
    let supervisor = Supervisor::start(&links(&["CI"]), options, recorder)
        .await
        .unwrap();

    let report = timeout(WAIT_TIMEOUT, supervisor.stop_all())
        .await
        .expect("stop_all finished");
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_run_until_stops_on_shutdown_signal() {
    let recorder = Arc::new(Recorder::default());
    let supervisor = start(&["A", "B"], recorder.clone()).await;
    let shutdown = CancellationToken::new();

    let running = {
        let supervisor = Arc::clone(&supervisor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { supervisor.run_until(shutdown.cancelled()).await })
    };

    send(addr_of(&supervisor, "B"), b"bob|x|before shutdown\n").await;
    wait_until(|| recorder.seen().len() == 1).await;
    assert!(!running.is_finished());

    shutdown.cancel();
    let report = timeout(WAIT_TIMEOUT, running)
        .await
        .expect("run_until finished")
        .expect("run_until task");

    assert!(report.is_clean());
    assert!(supervisor
        .links()
        .iter()
        .all(|link| link.state() == LinkState::Closed));
}

// ============================================================================
// Accept failures
// ============================================================================

#[tokio::test]
async fn test_fatal_accept_error_closes_only_that_link() {
    let recorder = Arc::new(Recorder::default());
    let spec = LinkSpec::new(Tag::new("GOOD").unwrap(), 0);
    let good = Link::bind(&spec, IpAddr::V4(Ipv4Addr::LOCALHOST))
        .await
        .unwrap();
    let supervisor = Supervisor::launch(
        vec![good, failing_link("BAD")],
        ServerOptions::default(),
        recorder.clone(),
    );

    let bad = supervisor.link("BAD").unwrap();
    timeout(WAIT_TIMEOUT, bad.closed())
        .await
        .expect("failing link closed");
    match bad.outcome() {
        Some(LinkOutcome::Failed(reason)) => assert!(reason.contains("Too many open files")),
        other => panic!("expected Failed, got {other:?}"),
    }

    // The sibling keeps serving
    let good = supervisor.link("GOOD").unwrap();
    wait_until(|| good.state() == LinkState::Listening).await;
    send(addr_of(&supervisor, "GOOD"), b"alice|x|still here\n").await;
    wait_until(|| recorder.seen().len() == 1).await;
    assert_eq!(recorder.seen()[0].body, "still here");

    let report = supervisor.stop_all().await;
    assert!(!report.is_clean());
    assert_eq!(report.links[0], (Tag::new("GOOD").unwrap(), LinkOutcome::Clean));
    assert!(matches!(report.links[1].1, LinkOutcome::Failed(_)));
}

#[tokio::test]
async fn test_run_until_returns_when_every_link_fails() {
    let supervisor = Supervisor::launch(
        vec![failing_link("A"), failing_link("B")],
        ServerOptions::default(),
        Arc::new(Recorder::default()),
    );

    // No shutdown signal ever arrives
    let report = timeout(WAIT_TIMEOUT, supervisor.run_until(std::future::pending()))
        .await
        .expect("run_until returned after every link failed");
    assert_eq!(report.links.len(), 2);
    assert!(report
        .links
        .iter()
        .all(|(_, outcome)| matches!(outcome, LinkOutcome::Failed(_))));
    assert!(supervisor.is_stopping());
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_bind_conflict_fails_fast() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let set = LinkSet::new(vec![
        LinkSpec::new(Tag::new("FREE").unwrap(), 0),
        LinkSpec::new(Tag::new("TAKEN").unwrap(), port),
    ])
    .unwrap();

    let result =
        Supervisor::start(&set, ServerOptions::default(), Arc::new(Recorder::default())).await;
    match result {
        Err(ServerError::Link(LinkError::Bind { tag, addr, .. })) => {
            assert_eq!(tag.as_str(), "TAKEN");
            assert_eq!(addr.port(), port);
        }
        Err(other) => panic!("expected bind error, got {other}"),
        Ok(_) => panic!("expected bind error, got a running supervisor"),
    }
}

// ============================================================================
// Single link
// ============================================================================

#[tokio::test]
async fn test_sentinel_alone_unblocks_accept() {
    let recorder = Arc::new(Recorder::default());
    let spec = LinkSpec::new(Tag::new("CI").unwrap(), 0);
    let link = Link::bind(&spec, IpAddr::V4(Ipv4Addr::LOCALHOST))
        .await
        .unwrap();
    let control = link.control();

    assert_eq!(control.state(), LinkState::Created);

    let work = InFlightWork::new();
    let context = HandlerContext {
        notifier: recorder.clone(),
        work: work.clone(),
        read_timeout: Duration::from_secs(1),
        delimiter: Arc::from("|x|"),
        shutdown: CancellationToken::new(),
    };
    let running = tokio::spawn(link.run(context));

    // Give the loop time to park in accept
    sleep(Duration::from_millis(50)).await;
    assert!(!running.is_finished());
    assert_eq!(control.state(), LinkState::Listening);

    // No listener close: only the flag and the self-dial
    control.request_stop();
    assert_eq!(control.state(), LinkState::Stopping);
    control.dial_sentinel().await.expect("sentinel delivered");

    let result = timeout(WAIT_TIMEOUT, running)
        .await
        .expect("accept loop exited")
        .expect("accept loop task");
    assert!(result.is_ok());
    assert_eq!(control.state(), LinkState::Closed);
    assert!(work.is_empty());
    assert!(recorder.seen().is_empty());

    // Late full stop is a no-op and must not error
    control.stop().await;
}

#[tokio::test]
async fn test_report_lists_every_link() {
    let recorder = Arc::new(Recorder::default());
    let supervisor = start(&["CI", "BOX"], recorder).await;
    let report = supervisor.stop_all().await;
    let tags: Vec<&str> = report.links.iter().map(|(tag, _)| tag.as_str()).collect();
    assert_eq!(tags, ["CI", "BOX"]);
    assert!(report
        .links
        .iter()
        .all(|(_, outcome)| *outcome == LinkOutcome::Clean));
}
