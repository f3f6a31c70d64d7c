//! `rinod` command line.
//!
//! ```bash
//! # Start in the foreground with two links
//! rinod --link CI:9001,BUILDBOX:9002 start
//!
//! # Start daemonized, logging to ~/.rino/rino.log
//! rinod --link CI:9001 start -d
//!
//! # Stop / query the instance serving those links
//! rinod --link CI:9001 stop
//! rinod --link CI:9001 status
//!
//! # Enable debug logging
//! RUST_LOG=rinod=debug rinod --link CI:9001 start
//! ```

use std::fs::{self, OpenOptions};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rino_core::LinkSet;

use crate::config::{
    default_config_path, default_service_dir, ConfigOverrides, DaemonConfig, FileConfig,
};
use crate::notifier::{Notifier, NotifierStyle};
use crate::pidfile::{is_process_running, read_running_pid, PidFile};
use crate::server::{BoundListener, LinkOutcome, Supervisor};
use crate::signals::ShutdownSignals;

/// Slack `stop` allows on top of the notifier timeout for links to close.
const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);

/// rino daemon - relays messages from SSH port forwards to desktop notifications
#[derive(Parser, Debug)]
#[command(name = "rinod", version, about)]
pub struct Args {
    /// Links to serve, as TAG:PORT[,TAG:PORT...]
    #[arg(short = 'l', long, global = true, env = "RINO_LINK")]
    pub link: Option<LinkSet>,

    /// Directory holding the PID file, log file and config file
    #[arg(long, global = true, env = "RINO_SERVICE_DIR")]
    pub service_dir: Option<PathBuf>,

    /// Config file [default: <service-dir>/rino.toml]
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'D', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the daemon (default)
    Start(StartArgs),
    /// Stop the instance serving the configured links
    Stop,
    /// Show whether an instance serves the configured links
    Status,
}

#[derive(ClapArgs, Debug, Default)]
pub struct StartArgs {
    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Program run for every notification
    #[arg(short = 'N', long)]
    pub notifier_cmd: Option<PathBuf>,

    /// Application id passed to terminal-notifier style programs
    #[arg(short = 'S', long)]
    pub notifier_sender: Option<String>,

    /// Force the notifier argument style instead of detecting it
    #[arg(long, value_enum)]
    pub notifier_style: Option<NotifierStyle>,

    /// Address the link listeners bind to
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Seconds to wait for a sender's payload
    #[arg(long, value_name = "SECS")]
    pub read_timeout: Option<u64>,

    /// Token separating sender from body
    #[arg(long)]
    pub delimiter: Option<String>,
}

impl Args {
    /// Resolves the full configuration from flags, config file and defaults.
    pub fn resolve(&self, start: &StartArgs) -> Result<DaemonConfig> {
        let service_dir = self.service_dir.clone().unwrap_or_else(default_service_dir);
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| default_config_path(&service_dir));
        let file = FileConfig::load(&config_path)?;

        let overrides = ConfigOverrides {
            link: self.link.clone(),
            bind_address: start.bind,
            notifier_cmd: start.notifier_cmd.clone(),
            notifier_sender: start.notifier_sender.clone(),
            notifier_style: start.notifier_style,
            read_timeout_secs: start.read_timeout,
            delimiter: start.delimiter.clone(),
            debug: self.debug,
        };
        Ok(DaemonConfig::resolve(service_dir, &config_path, overrides, file)?)
    }
}

/// Entry point of the `rinod` binary.
pub fn run() -> Result<()> {
    let mut args = Args::parse();
    let command = args
        .command
        .take()
        .unwrap_or_else(|| Command::Start(StartArgs::default()));

    match command {
        Command::Start(start) => {
            let config = args.resolve(&start)?;
            init_logging(config.debug, !start.daemon)?;
            start_daemon(config, start.daemon)
        }
        Command::Stop => {
            let config = args.resolve(&StartArgs::default())?;
            stop_daemon(&config)
        }
        Command::Status => {
            let config = args.resolve(&StartArgs::default())?;
            match read_running_pid(&config.pid_file())? {
                Some(pid) => {
                    println!("rinod is running (PID {pid})");
                    for link in &config.links {
                        println!("  {}: {}:{}", link.tag, config.bind_address, link.port);
                    }
                    Ok(())
                }
                None => {
                    println!("rinod is not running for {}", config.links);
                    process::exit(1);
                }
            }
        }
    }
}

/// Installs the global tracing subscriber.
fn init_logging(debug: bool, ansi: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for target in ["rinod", "rino_core", "rino_protocol"] {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .init();
    Ok(())
}

fn start_daemon(config: DaemonConfig, background: bool) -> Result<()> {
    fs::create_dir_all(&config.service_dir).with_context(|| {
        format!(
            "Failed to create service directory {}",
            config.service_dir.display()
        )
    })?;

    let pid_path = config.pid_file();
    if let Some(pid) = read_running_pid(&pid_path)? {
        bail!(
            "rinod is already running for {} (PID {pid}); use 'rinod stop' first",
            config.links
        );
    }

    // Bound before forking so a taken port fails the command itself
    let bound = Supervisor::bind_all(&config.links, config.bind_address)
        .context("Failed to start links")?;

    if background {
        daemonize(&config)?;
    }

    // Acquired after forking so the file names the daemon's own PID
    let pid_file = PidFile::acquire(&pid_path)?;
    let result = run_daemon(config, bound);
    pid_file.release();

    if let Err(e) = &result {
        error!(error = %e, "rinod exited with an error");
    }
    result
}

/// How long `stop` waits: a dispatch already running may take the full
/// notifier timeout, pending reads are abandoned at once.
fn stop_wait(config: &DaemonConfig) -> Duration {
    config.notify_timeout + STOP_GRACE
}

/// Sends SIGHUP to the running instance and waits for it to exit.
fn stop_daemon(config: &DaemonConfig) -> Result<()> {
    let Some(pid) = read_running_pid(&config.pid_file())? else {
        println!("rinod is not running for {}", config.links);
        return Ok(());
    };

    println!("Stopping rinod (PID {pid})...");
    send_hangup(pid)?;

    let wait = stop_wait(config);
    let polls = wait.as_millis() / STOP_POLL.as_millis();
    for _ in 0..polls {
        if !is_process_running(pid) {
            println!("rinod stopped.");
            return Ok(());
        }
        thread::sleep(STOP_POLL);
    }
    bail!("rinod (PID {pid}) did not stop within {wait:?}");
}

#[cfg(unix)]
fn send_hangup(pid: u32) -> Result<()> {
    let target = libc::pid_t::try_from(pid).context("PID out of range")?;
    // SAFETY: kill has no memory-safety preconditions
    let result = unsafe { libc::kill(target, libc::SIGHUP) };
    if result != 0 {
        bail!(
            "Failed to send SIGHUP to process {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_hangup(_pid: u32) -> Result<()> {
    bail!("Stop command is only supported on Unix systems");
}

/// Forks into the background, sending stdout/stderr to the log file.
fn daemonize(config: &DaemonConfig) -> Result<()> {
    use daemonize::Daemonize;

    let log_path = config.log_file();
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let stderr = stdout
        .try_clone()
        .context("Failed to open log file for stderr")?;

    Daemonize::new()
        .working_directory(&config.service_dir)
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the supervisor on the bound links until a shutdown signal arrives.
#[tokio::main]
async fn run_daemon(config: DaemonConfig, bound: Vec<BoundListener>) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        links = %config.links,
        notifier = %config.notifier_cmd.display(),
        "rinod starting"
    );

    let shutdown = CancellationToken::new();
    let signals = ShutdownSignals::register().context("Failed to install signal handlers")?;
    tokio::spawn(signals.forward(shutdown.clone()));

    let notifier: Arc<dyn Notifier> = Arc::new(config.notifier());
    let supervisor = Supervisor::start_bound(bound, config.server_options(), notifier)
        .await
        .context("Failed to start links")?;

    let report = supervisor.run_until(shutdown.cancelled()).await;
    for (tag, outcome) in &report.links {
        if *outcome != LinkOutcome::Clean {
            warn!(tag = %tag, outcome = ?outcome, "Link did not stop cleanly");
        }
    }

    if !shutdown.is_cancelled() {
        bail!("Every link failed, no listener left");
    }

    info!("rinod stopped");
    Ok(())
}
