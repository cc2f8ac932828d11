//! Item records: one per registered interest, stored in the handle table.
//!
//! An item captures the identity of a stream (domain, name, service,
//! channel, protocol stream id) plus its role in the item hierarchy:
//! plain single stream, batch parent or child, tunnel parent or sub-item,
//! or one of the administrative domains (login, directory, dictionary).

use std::sync::Arc;

use omx_core::{ChannelId, DomainType, ItemRequest};

use crate::client::ConsumerClient;
use crate::handle::Handle;
use crate::tunnel::TunnelMux;

/// Role of an item within the stream hierarchy.
pub enum ItemRole {
    /// A plain market-data stream.
    Single,
    /// Batch parent: carries no stream of its own after the group open, only
    /// tracks its live children. Destroyed when the count reaches zero.
    BatchParent { live_children: usize, children: Vec<Handle> },
    /// Child opened by a batch request; removal decrements the parent.
    BatchChild { parent: Handle },
    /// Tunnel stream parent, owning the sub-item id space.
    Tunnel { mux: TunnelMux },
    /// Sub-item riding inside a tunnel's private id space.
    Sub { parent: Handle, sub_stream_id: i32 },
    /// Login interest, fanned out over the login scope.
    Login,
    Directory,
    Dictionary,
}

impl ItemRole {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::BatchParent { .. } => "batch",
            Self::BatchChild { .. } => "batch_child",
            Self::Tunnel { .. } => "tunnel",
            Self::Sub { .. } => "sub",
            Self::Login => "login",
            Self::Directory => "directory",
            Self::Dictionary => "dictionary",
        }
    }
}

/// One registered interest. Owned by the registry's handle table.
pub struct Item {
    pub role: ItemRole,
    pub domain: DomainType,
    pub name: String,
    pub service_name: Option<String>,
    /// Routed channel; `None` until the open is submitted (or never, for
    /// batch parents after decomposition).
    pub channel: Option<ChannelId>,
    /// Protocol stream id on `channel`; 0 while unassigned. For sub-items
    /// this is the id inside the parent tunnel's private space.
    pub stream_id: i32,
    pub private_stream: bool,
    pub streaming: bool,
    /// Opaque application token echoed in every event.
    pub closure: u64,
    pub client: Arc<dyn ConsumerClient>,
}

impl Item {
    pub fn from_request(
        req: &ItemRequest,
        role: ItemRole,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Self {
        Self {
            role,
            domain: req.domain,
            name: req.name.clone(),
            service_name: req.service_name.clone(),
            channel: None,
            stream_id: 0,
            private_stream: req.private_stream,
            streaming: req.streaming,
            closure,
            client,
        }
    }

    pub fn is_batch_parent(&self) -> bool {
        matches!(self.role, ItemRole::BatchParent { .. })
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self.role, ItemRole::Tunnel { .. })
    }

    pub fn batch_parent(&self) -> Option<Handle> {
        match self.role {
            ItemRole::BatchChild { parent } => Some(parent),
            _ => None,
        }
    }

    pub fn sub_parent(&self) -> Option<Handle> {
        match self.role {
            ItemRole::Sub { parent, .. } => Some(parent),
            _ => None,
        }
    }
}
