//! OS signals that stop the daemon.
//!
//! ## Unix
//! SIGHUP, SIGINT, SIGTERM and SIGQUIT all request a graceful shutdown.
//! SIGHUP is what `rinod stop` sends.
//!
//! ## Other platforms
//! Only [`tokio::signal::ctrl_c`] is awaited.

use std::io;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Registered shutdown signal handlers.
///
/// Handlers are installed by [`register`](Self::register), so a signal
/// delivered before [`forward`](Self::forward) runs is still seen.
#[cfg(unix)]
pub struct ShutdownSignals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

#[cfg(not(unix))]
pub struct ShutdownSignals {
    _private: (),
}

impl ShutdownSignals {
    /// Installs the handlers. Must be called inside a tokio runtime.
    #[cfg(unix)]
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    #[cfg(not(unix))]
    pub fn register() -> io::Result<Self> {
        Ok(Self { _private: () })
    }

    /// Waits for the next signal and returns its name.
    ///
    /// Returns `None` once no more signals can be received.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            s = self.hangup.recv() => s.map(|()| "SIGHUP"),
            s = self.interrupt.recv() => s.map(|()| "SIGINT"),
            s = self.terminate.recv() => s.map(|()| "SIGTERM"),
            s = self.quit.recv() => s.map(|()| "SIGQUIT"),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|()| "ctrl-c")
    }

    /// Cancels `token` on the first signal.
    ///
    /// Runs until the signal streams end; later signals are logged and
    /// otherwise ignored.
    pub async fn forward(mut self, token: CancellationToken) {
        while let Some(name) = self.recv().await {
            if token.is_cancelled() {
                warn!(signal = name, "Shutdown already in progress, ignoring signal");
            } else {
                info!(signal = name, "Received shutdown signal");
                token.cancel();
            }
        }
    }
}
