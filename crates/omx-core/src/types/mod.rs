//! Shared type definitions for the OMX consumer runtime.
//!
//! Split into focused submodules:
//! - `domain` — protocol message domains and reserved stream ids
//! - `state` — stream/data state carried by refresh and status events
//! - `request` — outbound request shapes (item, tunnel, post, generic)
//! - `msg` — decoded inbound messages and the synthesized closed status

pub mod domain;
pub mod msg;
pub mod request;
pub mod state;

pub use domain::*;
pub use msg::*;
pub use request::*;
pub use state::*;
