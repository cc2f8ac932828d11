//! # omx-core
//!
//! Core crate for the OMX consumer runtime, providing:
//!
//! - **Types** (`types`) — protocol domains, request shapes, decoded messages,
//!   stream state
//! - **Configuration** (`config`) — JSON config deserialization
//! - **Error types** (`error`) — domain-specific `OmxError` via thiserror
//! - **Logging** (`logging`) — tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export types at crate root for convenience.
pub use config::ConsumerConfig;
pub use error::OmxError;
pub use types::*;
