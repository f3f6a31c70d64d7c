//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur while building link configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Link set string contained no entries
    #[error("No links configured (expected TAG:PORT[,TAG:PORT...])")]
    EmptyLinkSet,

    /// One `TAG:PORT` entry could not be parsed
    #[error("Invalid link '{entry}': {reason}")]
    InvalidLink { entry: String, reason: String },

    /// Tag is empty or contains reserved characters
    #[error("Invalid tag '{tag}': {reason}")]
    InvalidTag { tag: String, reason: String },

    /// Two links share a tag
    #[error("Duplicate link tag: {tag}")]
    DuplicateTag { tag: String },

    /// Two links share a port
    #[error("Port {port} is used by more than one link")]
    DuplicatePort { port: u16 },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
