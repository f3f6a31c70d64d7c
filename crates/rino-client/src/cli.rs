//! `rino` command line.
//!
//! ```text
//! rino send --port 9001 --sender alice build finished
//! make 2>&1 | tail -1 | rino send --port 9001
//! ```

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rino_protocol::{Message, DEFAULT_DELIMITER, DEFAULT_SENDER};

use crate::client::{send_message, SendOptions};
use crate::error::ClientError;

/// rino - push a desktop notification through an SSH port forward
#[derive(Parser, Debug)]
#[command(name = "rino", version, about)]
pub struct Args {
    /// Enable debug logging on stderr
    #[arg(short = 'D', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one message to a link port
    Send(SendArgs),
}

#[derive(ClapArgs, Debug)]
pub struct SendArgs {
    /// Link port to send to
    #[arg(short, long, env = "RINO_PORT")]
    pub port: u16,

    /// Host the port is reachable on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Name shown as the notification sender
    #[arg(short, long, default_value = DEFAULT_SENDER, env = "RINO_SENDER")]
    pub sender: String,

    /// Token separating sender from body; must match the daemon's
    #[arg(long, default_value = DEFAULT_DELIMITER)]
    pub delimiter: String,

    /// Seconds allowed for connecting and for writing
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub timeout: u64,

    /// Message words; read from stdin when omitted
    pub message: Vec<String>,
}

impl SendArgs {
    pub fn options(&self) -> SendOptions {
        SendOptions::with_addr(SocketAddr::new(self.host, self.port))
            .delimiter(self.delimiter.clone())
            .timeout(Duration::from_secs(self.timeout))
    }

    /// Message body from the arguments, or from `stdin` when there are none.
    pub fn body(&self, mut stdin: impl Read) -> Result<String, ClientError> {
        if !self.message.is_empty() {
            return Ok(self.message.join(" "));
        }
        let mut body = String::new();
        stdin
            .read_to_string(&mut body)
            .map_err(ClientError::Stdin)?;
        // One message per connection; newlines inside would end it early
        Ok(body.trim_end().replace(['\r', '\n'], " "))
    }
}

/// Entry point of the `rino` binary.
pub fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug)?;

    match args.command {
        Command::Send(send) => {
            let body = send.body(io::stdin().lock())?;
            if body.is_empty() {
                bail!("Nothing to send: pass a message or pipe one on stdin");
            }
            let message = Message::new(send.sender.clone(), body);
            send_blocking(&send.options(), &message)
        }
    }
}

fn init_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("rino_client={level}").parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn send_blocking(options: &SendOptions, message: &Message) -> Result<()> {
    send_message(options, message)
        .await
        .with_context(|| format!("Failed to notify via {}", options.addr))?;
    Ok(())
}
