//! rino core - Shared types for the notification relay
//!
//! This crate provides the domain types shared between
//! the daemon (rinod) and the sender client (rino).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod link;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use link::{LinkSet, LinkSpec, Tag};
