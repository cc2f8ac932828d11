//! Stream and data state carried by refresh and status events.

use serde::{Deserialize, Serialize};

/// Lifetime state of a stream as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StreamStateKind {
    /// Stream is open; updates will follow.
    Open = 1,
    /// Snapshot delivery; the stream closes once the refresh completes.
    NonStreaming = 2,
    /// Stream closed, but the item may be recoverable on another service.
    ClosedRecover = 3,
    /// Stream closed permanently.
    Closed = 4,
    /// Server redirected the request elsewhere.
    Redirected = 5,
}

/// Health of the data on an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataState {
    Ok = 1,
    Suspect = 2,
}

/// Combined state attached to refresh and status messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    pub stream: StreamStateKind,
    pub data: DataState,
    pub text: String,
}

impl StreamState {
    /// State carried by the synthesized closed-status event: closed stream,
    /// suspect data, source unknown.
    pub fn closed(text: impl Into<String>) -> Self {
        Self {
            stream: StreamStateKind::Closed,
            data: DataState::Suspect,
            text: text.into(),
        }
    }

    pub fn open_ok(text: impl Into<String>) -> Self {
        Self {
            stream: StreamStateKind::Open,
            data: DataState::Ok,
            text: text.into(),
        }
    }

    /// Whether the stream remains open after this state is applied.
    pub fn is_open(&self) -> bool {
        self.stream == StreamStateKind::Open
    }
}
