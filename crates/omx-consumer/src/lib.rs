//! # omx-consumer
//!
//! Item registry and stream-multiplexing engine for the OMX consumer runtime.
//!
//! Applications open named item streams against a server, receive
//! refresh/update/status events, and may multiplex many logical sub-streams
//! inside one server-negotiated tunnel stream. This crate is the engine that
//! turns open/modify/close/post calls into protocol stream identities:
//!
//! - **Timer queue** (`timer`) — deadline-ordered one-shot deferred actions
//! - **Handle table** (`handle`) — generation-checked slot table; handles
//!   never alias a live item and stale handles fail deterministically
//! - **Item model** (`item`) — single/batch/tunnel/sub/login/directory/
//!   dictionary stream variants and their state machines
//! - **Registry** (`registry`) — handle map + insertion-ordered list +
//!   stream-route index over the live item set
//! - **Tunnel multiplexing** (`tunnel`) — private sub-stream id space with
//!   first-fit reuse
//! - **Login fan-out** (`login`) — one login scope across all channels
//! - **Engine** (`engine`) — the register/reissue/submit/unregister surface
//!   and the dispatch cycle
//!
//! The wire codec, socket transport, and directory catalog are collaborators
//! consumed through the traits in `transport`.

pub mod client;
pub mod engine;
pub mod handle;
pub mod item;
pub mod login;
pub mod registry;
pub mod timer;
pub mod transport;
pub mod tunnel;

pub use client::{ConsumerClient, ErrorClient, ItemEvent};
pub use engine::ConsumerEngine;
pub use handle::Handle;
pub use transport::{Directory, SubMsgCodec, Transport, TransportEvent};
