//! Desktop notification delivery.
//!
//! The daemon never talks to a notification service directly; it runs an
//! external command per message. Two command-line conventions are known:
//!
//! - `notify-send TITLE BODY` (Linux desktops, the default)
//! - `terminal-notifier -title TITLE -message BODY -sender APP [-open URL]` (macOS)
//!
//! Failures are reported as [`NotifyError`]; callers log them and move on.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use rino_core::Tag;
use rino_protocol::{extract_url, Message};

use crate::work::InFlightWork;

/// Default notifier program.
pub const DEFAULT_NOTIFIER_CMD: &str = "/usr/bin/notify-send";

/// Default application id passed to terminal-notifier (controls the icon).
pub const DEFAULT_NOTIFIER_SENDER: &str = "com.apple.Terminal";

/// How long a notifier command may run before it is killed.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Notification
// ============================================================================

/// One notification to display: a parsed message plus the link it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub tag: Tag,
    pub sender: String,
    pub body: String,
    /// First URL found in the body, if any
    pub url: Option<String>,
}

impl Notification {
    pub fn new(tag: Tag, message: Message) -> Self {
        let url = extract_url(&message.body);
        Self {
            tag,
            sender: message.sender,
            body: message.body,
            url,
        }
    }

    /// Notification title, `"TAG: sender"`.
    pub fn title(&self) -> String {
        format!("{}: {}", self.tag, self.sender.trim())
    }
}

// ============================================================================
// Notifier trait
// ============================================================================

/// Something that can surface a notification to the operator.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Errors from a notifier invocation. Never fatal to the daemon.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to run notifier {program}: {error}")]
    Spawn { program: PathBuf, error: String },

    #[error("Notifier {program} exited with {status}: {stderr}")]
    Failed {
        program: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("Notifier {program} did not finish within {after:?}")]
    Timeout { program: PathBuf, after: Duration },
}

/// Hands `notification` to `notifier` as its own unit of tracked work.
///
/// The caller returns immediately; the dispatch is counted in `work` until
/// the notifier finishes. Errors are logged here and go no further.
pub fn dispatch(
    work: &InFlightWork,
    notifier: Arc<dyn Notifier>,
    notification: Notification,
) -> JoinHandle<()> {
    work.spawn(async move {
        match notifier.notify(&notification).await {
            Ok(()) => debug!(
                tag = %notification.tag,
                sender = %notification.sender,
                "Notification delivered"
            ),
            Err(e) => warn!(
                tag = %notification.tag,
                sender = %notification.sender,
                error = %e,
                "Notification failed"
            ),
        }
    })
}

// ============================================================================
// Command notifier
// ============================================================================

/// Argument convention of the notifier program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum NotifierStyle {
    /// `PROGRAM TITLE BODY`
    NotifySend,
    /// `PROGRAM -title TITLE -message BODY -sender APP [-open URL]`
    TerminalNotifier,
}

impl NotifierStyle {
    /// Guesses the style from the program's file name.
    pub fn detect(program: &Path) -> Self {
        let is_terminal_notifier = program
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("terminal-notifier"));

        if is_terminal_notifier {
            Self::TerminalNotifier
        } else {
            Self::NotifySend
        }
    }
}

/// Runs an external program for every notification.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: PathBuf,
    style: NotifierStyle,
    app_sender: String,
    timeout: Duration,
}

impl CommandNotifier {
    /// Creates a notifier for `program`, detecting its argument style.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            style: NotifierStyle::detect(&program),
            program,
            app_sender: DEFAULT_NOTIFIER_SENDER.to_string(),
            timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_style(mut self, style: NotifierStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_app_sender(mut self, app_sender: impl Into<String>) -> Self {
        self.app_sender = app_sender.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn style(&self) -> NotifierStyle {
        self.style
    }

    /// Command-line arguments for one notification.
    pub fn args(&self, notification: &Notification) -> Vec<String> {
        match self.style {
            NotifierStyle::NotifySend => vec![notification.title(), notification.body.clone()],
            NotifierStyle::TerminalNotifier => {
                let mut args = vec![
                    "-title".to_string(),
                    notification.title(),
                    "-message".to_string(),
                    notification.body.clone(),
                    "-sender".to_string(),
                    self.app_sender.clone(),
                ];
                if let Some(url) = &notification.url {
                    args.push("-open".to_string());
                    args.push(url.clone());
                }
                args
            }
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let args = self.args(notification);
        debug!(program = %self.program.display(), ?args, "Running notifier");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NotifyError::Spawn {
                program: self.program.clone(),
                error: e.to_string(),
            })?;

        // On timeout the child is dropped, and kill_on_drop reaps it
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(NotifyError::Spawn {
                    program: self.program.clone(),
                    error: e.to_string(),
                })
            }
            Err(_) => {
                return Err(NotifyError::Timeout {
                    program: self.program.clone(),
                    after: self.timeout,
                })
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(NotifyError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
