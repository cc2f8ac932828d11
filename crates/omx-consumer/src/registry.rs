//! Live item set: handle table, insertion-ordered list, stream-route index.
//!
//! The registry keeps three synchronized views. The handle table answers
//! generation-checked handle lookups; the insertion-ordered list drives the
//! shutdown sweep and diagnostics; the `(channel, stream id)` index routes
//! inbound messages to their owning item. All three are updated together
//! here so the engine never sees them disagree.

use ahash::AHashMap;
use omx_core::ChannelId;

use crate::handle::{Handle, SlotTable};
use crate::item::Item;

pub struct ItemRegistry {
    items: SlotTable<Item>,
    /// Live handles in registration order.
    order: Vec<Handle>,
    /// Inbound route: protocol stream identity to owning item.
    routes: AHashMap<(ChannelId, i32), Handle>,
}

impl ItemRegistry {
    pub fn with_capacity(item_count_hint: usize) -> Self {
        Self {
            items: SlotTable::with_capacity(item_count_hint),
            order: Vec::with_capacity(item_count_hint),
            routes: AHashMap::with_capacity(item_count_hint),
        }
    }

    pub fn insert(&mut self, item: Item) -> Handle {
        let handle = self.items.insert(item);
        self.order.push(handle);
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&Item> {
        self.items.get(handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Item> {
        self.items.get_mut(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.items.contains(handle)
    }

    /// Record the stream identity of an item once its open is submitted.
    pub fn route(&mut self, channel: ChannelId, stream_id: i32, handle: Handle) {
        self.routes.insert((channel, stream_id), handle);
    }

    pub fn lookup_route(&self, channel: ChannelId, stream_id: i32) -> Option<Handle> {
        self.routes.get(&(channel, stream_id)).copied()
    }

    /// Remove an item from all three views. Idempotent.
    pub fn remove(&mut self, handle: Handle) -> Option<Item> {
        let item = self.items.remove(handle)?;
        if let Some(pos) = self.order.iter().position(|h| *h == handle) {
            self.order.remove(pos);
        }
        if let Some(channel) = item.channel {
            // Only unroute if the entry still points at this item; a stale
            // handle must not evict a reused stream identity.
            if self.routes.get(&(channel, item.stream_id)) == Some(&handle) {
                self.routes.remove(&(channel, item.stream_id));
            }
        }
        Some(item)
    }

    /// Snapshot of live handles in registration order. Cloned so callers
    /// can remove items while walking it; entries removed in the meantime
    /// simply fail their lookup.
    pub fn handles(&self) -> Vec<Handle> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ConsumerClient;
    use crate::item::ItemRole;
    use omx_core::{DomainType, ItemRequest};
    use std::sync::Arc;

    struct Nop;
    impl ConsumerClient for Nop {}

    fn item(name: &str) -> Item {
        let req = ItemRequest::market_price(name, "FEED");
        Item::from_request(&req, ItemRole::Single, Arc::new(Nop), 0)
    }

    #[test]
    fn map_and_list_stay_in_step() {
        let mut reg = ItemRegistry::with_capacity(4);
        let a = reg.insert(item("A"));
        let b = reg.insert(item("B"));
        let c = reg.insert(item("C"));
        assert_eq!(reg.len(), reg.handles().len());
        assert_eq!(reg.handles(), vec![a, b, c]);

        reg.remove(b);
        assert_eq!(reg.len(), reg.handles().len());
        assert_eq!(reg.handles(), vec![a, c]);
        for h in reg.handles() {
            assert!(reg.contains(h));
        }

        // Idempotent removal leaves both views untouched.
        reg.remove(b);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.handles(), vec![a, c]);
    }

    #[test]
    fn route_resolves_after_open() {
        let mut reg = ItemRegistry::with_capacity(4);
        let h = reg.insert(item("A"));
        {
            let it = reg.get_mut(h).unwrap();
            it.channel = Some(ChannelId(1));
            it.stream_id = 5;
        }
        reg.route(ChannelId(1), 5, h);

        assert_eq!(reg.lookup_route(ChannelId(1), 5), Some(h));
        assert_eq!(reg.lookup_route(ChannelId(2), 5), None);
    }

    #[test]
    fn remove_clears_route() {
        let mut reg = ItemRegistry::with_capacity(4);
        let h = reg.insert(item("A"));
        reg.get_mut(h).unwrap().channel = Some(ChannelId(1));
        reg.get_mut(h).unwrap().stream_id = 5;
        reg.route(ChannelId(1), 5, h);

        let removed = reg.remove(h).unwrap();
        assert_eq!(removed.domain, DomainType::MarketPrice);
        assert_eq!(reg.lookup_route(ChannelId(1), 5), None);
        assert!(reg.remove(h).is_none());
    }

    #[test]
    fn stale_remove_keeps_reused_route() {
        let mut reg = ItemRegistry::with_capacity(4);
        let a = reg.insert(item("A"));
        reg.get_mut(a).unwrap().channel = Some(ChannelId(1));
        reg.get_mut(a).unwrap().stream_id = 5;
        reg.route(ChannelId(1), 5, a);
        reg.remove(a);

        let b = reg.insert(item("B"));
        reg.get_mut(b).unwrap().channel = Some(ChannelId(1));
        reg.get_mut(b).unwrap().stream_id = 5;
        reg.route(ChannelId(1), 5, b);

        // Removing the stale handle again must not disturb B's route.
        assert!(reg.remove(a).is_none());
        assert_eq!(reg.lookup_route(ChannelId(1), 5), Some(b));
    }
}
