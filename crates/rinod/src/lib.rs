//! rino daemon - relays messages from SSH port forwards to desktop notifications
//!
//! This crate provides the daemon's building blocks:
//! - `server` - Link listeners, their accept loops and the supervisor owning them
//! - `notifier` - Delivery of parsed messages to the desktop
//! - `work` - Tracking of in-flight asynchronous work for graceful shutdown
//! - `pidfile` - One instance per link identity
//! - `config` - Flag / file / default configuration layers
//! - `signals` - OS signals that request shutdown
//! - `cli` - The `rinod` command line
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        rinod daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ ShutdownSignals │────▶│        Supervisor           │    │
//! │  │ (HUP/INT/TERM/  │     │  Link "CI"   Link "BOX" ... │    │
//! │  │  QUIT)          │     └──────────────┬──────────────┘    │
//! │  └─────────────────┘                    │ accept            │
//! │                                         ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │    Notifier     │◀────│     ConnectionHandler       │    │
//! │  │ (notify-send)   │     │  (one message per conn)     │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Failures after startup are logged, never propagated into sibling work

pub mod cli;
pub mod config;
pub mod notifier;
pub mod pidfile;
pub mod server;
pub mod signals;
pub mod work;
