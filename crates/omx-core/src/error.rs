//! Typed error definitions for the OMX consumer runtime.
//!
//! Provides [`OmxError`] for the errors the engine can surface to callers.
//! All variants implement `std::error::Error` via `thiserror`, so they
//! integrate seamlessly with `anyhow::Result` at the application edge.
//!
//! Routing failures (unknown service name or id) are deliberately absent:
//! they are never raised to the caller, they are delivered asynchronously as
//! a closed-status event on the item's own stream. Transport submit failures
//! surface as [`OmxError::InvalidUsage`] with the transport diagnostic text
//! appended.

use thiserror::Error;

/// Errors surfaced by the OMX consumer engine.
#[derive(Debug, Error)]
pub enum OmxError {
    /// Item or registry allocation failed.
    #[error("memory exhaustion: {0}")]
    MemoryExhaustion(String),

    /// Malformed or disallowed request — modifying a batch stream, reusing a
    /// sub-stream id, missing service identification, or a failed transport
    /// submit (with the transport's diagnostic attached).
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// The handle is not (or is no longer) present in the item registry.
    #[error("invalid handle: {0:#x}")]
    InvalidHandle(u64),
}

impl OmxError {
    /// The message text carried by the error.
    pub fn text(&self) -> String {
        match self {
            Self::MemoryExhaustion(t) | Self::InvalidUsage(t) => t.clone(),
            Self::InvalidHandle(h) => format!("handle {h:#x} not found"),
        }
    }
}
