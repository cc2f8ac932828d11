//! Login scope: the one login stream shared by every channel.
//!
//! Login is a per-connection concern, not a per-channel one. Each channel
//! carries the reserved login stream id, but the application sees a single
//! login item; outbound login traffic fans out over every established
//! channel in establishment order and inbound login events fan in to every
//! registered login item in registration order.
//!
//! This is the one structure touched by both the dispatch thread (a channel
//! completes its handshake) and a concurrent registration call reading the
//! channel list for fan-out, so it carries its own lock, held only for the
//! scan or mutation. Everything else in the engine mutates on a single
//! thread at a time and needs none.

use std::sync::{Mutex, MutexGuard, PoisonError};

use omx_core::ChannelId;

use crate::handle::Handle;

struct LoginState {
    /// Channels that completed the login handshake, in establishment order.
    channels: Vec<ChannelId>,
    /// Registered login items, in registration order.
    items: Vec<Handle>,
}

pub struct LoginScope {
    state: Mutex<LoginState>,
}

impl LoginScope {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoginState {
                channels: Vec::new(),
                items: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoginState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_channel(&self, channel: ChannelId) {
        let mut state = self.lock();
        if !state.channels.contains(&channel) {
            state.channels.push(channel);
        }
    }

    pub fn remove_channel(&self, channel: ChannelId) {
        self.lock().channels.retain(|c| *c != channel);
    }

    /// Established channels in establishment order; a snapshot, so the
    /// caller fans out without holding the lock.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.lock().channels.clone()
    }

    pub fn add_item(&self, handle: Handle) {
        self.lock().items.push(handle);
    }

    pub fn remove_item(&self, handle: Handle) {
        self.lock().items.retain(|h| *h != handle);
    }

    /// Login items in registration order; a snapshot, so the caller can
    /// mutate the registry while iterating.
    pub fn items(&self) -> Vec<Handle> {
        self.lock().items.clone()
    }

    pub fn has_items(&self) -> bool {
        !self.lock().items.is_empty()
    }
}

impl Default for LoginScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn channels_keep_establishment_order_without_duplicates() {
        let scope = LoginScope::new();
        scope.add_channel(ChannelId(3));
        scope.add_channel(ChannelId(1));
        scope.add_channel(ChannelId(3));
        assert_eq!(scope.channels(), vec![ChannelId(3), ChannelId(1)]);

        scope.remove_channel(ChannelId(3));
        assert_eq!(scope.channels(), vec![ChannelId(1)]);
    }

    #[test]
    fn items_keep_registration_order() {
        let scope = LoginScope::new();
        let a = Handle::from_u64(1 << 32);
        let b = Handle::from_u64((1 << 32) | 1);
        scope.add_item(a);
        scope.add_item(b);
        assert_eq!(scope.items(), vec![a, b]);

        scope.remove_item(a);
        assert_eq!(scope.items(), vec![b]);
        assert!(scope.has_items());
    }

    #[test]
    fn scope_is_shared_across_threads() {
        let scope = Arc::new(LoginScope::new());
        let other = scope.clone();
        let worker = std::thread::spawn(move || {
            other.add_channel(ChannelId(2));
            other.add_item(Handle::from_u64(1 << 32));
        });
        scope.add_channel(ChannelId(1));
        worker.join().unwrap();

        assert_eq!(scope.channels().len(), 2);
        assert!(scope.has_items());
    }
}
