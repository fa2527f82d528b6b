//! Errors returned by [`crate::RunStore`] operations.

use std::fmt;

/// Errors a Run Store adapter can return.
///
/// Plain enum, manual `Display`/`Error` impls — matches the error-type
/// style used throughout this workspace; these are `rootcause::Report`
/// contexts at call sites, not `thiserror`-derived types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStoreError {
    /// No run (or event) with the given ID is known to this adapter.
    NotFound(String),
    /// The operation conflicts with the run's current state: an illegal
    /// status transition, or an append after the terminal event.
    Conflict(String),
    /// The backing store could not be reached or returned an error.
    Unavailable(String),
}

impl fmt::Display for RunStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Unavailable(msg) => write!(f, "unavailable: {msg}"),
        }
    }
}

impl std::error::Error for RunStoreError {}
