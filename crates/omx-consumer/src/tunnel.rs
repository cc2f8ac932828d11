//! Tunnel sub-stream multiplexer.
//!
//! Each tunnel item owns a private sub-stream id space, disjoint from the
//! channel's main stream ids. Ids start at [`STARTING_SUB_STREAM_ID`]; the
//! slots below it are reserved for the tunnel's own negotiation. Freed slots
//! are reused first-fit, and the table grows on demand when a caller
//! requests an id beyond the current bound.

use crate::handle::Handle;
use crate::transport::{CodecError, SubMsgCodec, SubStreamMsg};

/// First id handed out to tunnel sub-items.
pub const STARTING_SUB_STREAM_ID: i32 = 5;

/// Initial encode buffer size for sub-stream messages; doubled on demand.
const INITIAL_SUB_BUF_SIZE: usize = 256;

/// Sub-item table of one tunnel stream.
///
/// Indexed by `sub_stream_id - STARTING_SUB_STREAM_ID`; a `None` slot is
/// free for reuse.
pub struct TunnelMux {
    slots: Vec<Option<Handle>>,
}

impl Default for TunnelMux {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelMux {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Allocate the lowest free sub-stream id for `handle`.
    pub fn add(&mut self, handle: Handle) -> i32 {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return STARTING_SUB_STREAM_ID + idx as i32;
            }
        }
        self.slots.push(Some(handle));
        STARTING_SUB_STREAM_ID + (self.slots.len() - 1) as i32
    }

    /// Bind `handle` to a caller-chosen id. Fails if the id falls in the
    /// reserved range or is already in use; grows the table when the id lies
    /// beyond the current bound.
    pub fn add_at(&mut self, handle: Handle, sub_stream_id: i32) -> Result<(), SubIdError> {
        if sub_stream_id < STARTING_SUB_STREAM_ID {
            return Err(SubIdError::Reserved(sub_stream_id));
        }
        let idx = (sub_stream_id - STARTING_SUB_STREAM_ID) as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        if self.slots[idx].is_some() {
            return Err(SubIdError::InUse(sub_stream_id));
        }
        self.slots[idx] = Some(handle);
        Ok(())
    }

    pub fn get(&self, sub_stream_id: i32) -> Option<Handle> {
        if sub_stream_id < STARTING_SUB_STREAM_ID {
            return None;
        }
        let idx = (sub_stream_id - STARTING_SUB_STREAM_ID) as usize;
        self.slots.get(idx).copied().flatten()
    }

    /// Free the slot of `sub_stream_id`, returning the handle it held.
    pub fn remove(&mut self, sub_stream_id: i32) -> Option<Handle> {
        if sub_stream_id < STARTING_SUB_STREAM_ID {
            return None;
        }
        let idx = (sub_stream_id - STARTING_SUB_STREAM_ID) as usize;
        self.slots.get_mut(idx).and_then(|slot| slot.take())
    }

    /// All live sub-item handles, in id order.
    pub fn live(&self) -> Vec<(i32, Handle)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                slot.map(|h| (STARTING_SUB_STREAM_ID + idx as i32, h))
            })
            .collect()
    }
}

/// Sub-stream id allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubIdError {
    /// Id falls in the tunnel's reserved range.
    Reserved(i32),
    /// Id is already bound to a live sub-item.
    InUse(i32),
}

impl std::fmt::Display for SubIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reserved(id) => write!(f, "sub-stream id {id} is reserved"),
            Self::InUse(id) => write!(f, "sub-stream id {id} already in use"),
        }
    }
}

/// Encode a sub-stream message, doubling the buffer until it fits.
pub fn encode_sub_msg(codec: &dyn SubMsgCodec, msg: &SubStreamMsg) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; INITIAL_SUB_BUF_SIZE];
    loop {
        match codec.encode(msg, &mut buf) {
            Ok(len) => {
                buf.truncate(len);
                return Ok(buf);
            }
            Err(CodecError::BufferTooSmall) => {
                let doubled = buf.len() * 2;
                buf = vec![0u8; doubled];
            }
            Err(e) => return Err(e),
        }
    }
}
