//! rino sender - library modules
//!
//! Pushes one message into a link port of a running `rinod`, normally
//! through the remote end of an SSH port forward:
//!
//! ```text
//! remote host                          local desktop
//! ┌────────────┐   ssh -R 9001:...    ┌──────────────┐
//! │ rino send  │ ───────────────────▶ │ rinod  CI    │ ──▶ notification
//! └────────────┘                      └──────────────┘
//! ```

pub mod cli;
pub mod client;
pub mod error;

// Re-export commonly used types
pub use client::{send_message, SendOptions, DEFAULT_CONNECT_TIMEOUT};
pub use error::{ClientError, Result};
