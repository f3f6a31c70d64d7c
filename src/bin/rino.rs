//! rino sender
//!
//! Pushes one message into a link port, usually the remote end of an SSH
//! port forward. See `rino --help`.

fn main() -> anyhow::Result<()> {
    rino_client::cli::run()
}
