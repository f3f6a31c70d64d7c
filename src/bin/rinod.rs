//! rino daemon
//!
//! Listens on one local TCP port per link and turns every message received
//! into a desktop notification. See `rinod --help`.

fn main() -> anyhow::Result<()> {
    rinod::cli::run()
}
