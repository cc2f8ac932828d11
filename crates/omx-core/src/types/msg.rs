//! Decoded inbound messages.
//!
//! The transport delivers already-decoded message heads; the engine routes
//! them by stream identity and forwards them to the registered client
//! callback. Payload bodies stay opaque bytes — field-list decoding belongs
//! to the wire codec collaborator.

use super::domain::DomainType;
use super::state::StreamState;

/// Class of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    Refresh,
    Update,
    Status,
    Generic,
    Ack,
}

/// A decoded message delivered on an item stream.
#[derive(Debug, Clone)]
pub struct ItemMsg {
    pub kind: MsgKind,
    pub domain: DomainType,
    /// Present on refresh and status messages that carry state.
    pub state: Option<StreamState>,
    /// Refresh-complete flag; meaningful only for `MsgKind::Refresh`.
    pub complete: bool,
    pub payload: Vec<u8>,
}

impl ItemMsg {
    pub fn refresh(domain: DomainType, state: StreamState, complete: bool) -> Self {
        Self {
            kind: MsgKind::Refresh,
            domain,
            state: Some(state),
            complete,
            payload: Vec::new(),
        }
    }

    pub fn update(domain: DomainType) -> Self {
        Self {
            kind: MsgKind::Update,
            domain,
            state: None,
            complete: false,
            payload: Vec::new(),
        }
    }

    pub fn status(domain: DomainType, state: StreamState) -> Self {
        Self {
            kind: MsgKind::Status,
            domain,
            state: Some(state),
            complete: false,
            payload: Vec::new(),
        }
    }
}

/// The synthesized terminal status delivered when an item cannot be opened.
///
/// Captures the minimal request identity needed to build the event without
/// re-decoding the original request.
#[derive(Debug, Clone)]
pub struct ClosedStatus {
    pub name: String,
    pub service_name: Option<String>,
    pub domain: DomainType,
    pub stream_id: i32,
    pub private_stream: bool,
    pub state: StreamState,
}
