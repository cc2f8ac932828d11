//! Opaque item handles backed by a generation-checked slot table.
//!
//! A [`Handle`] packs `(slot index, generation)` into one `u64`. The
//! generation is bumped whenever a slot is vacated, so a stale handle held
//! by the application after its item was removed fails the lookup
//! deterministically instead of resolving to whatever reused the slot.
//! Generations start at 1, which keeps every live handle distinct from
//! [`Handle::NONE`].

/// Opaque, process-unique identifier for a live item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// The "no handle" sentinel. Never names a live item.
    pub const NONE: Handle = Handle(0);

    fn new(slot: u32, generation: u32) -> Self {
        Handle(((generation as u64) << 32) | slot as u64)
    }

    fn slot(self) -> u32 {
        self.0 as u32
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw integer form, as exposed to the application.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw integer form. The result still goes
    /// through generation checking on lookup.
    pub fn from_u64(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SlotTable
// ---------------------------------------------------------------------------

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Growable arena of slots plus a free-list.
///
/// Freed slots are reused in LIFO order with a bumped generation.
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value, returning its handle.
    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.value = Some(value);
            Handle::new(slot, s.generation)
        } else {
            let slot = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 1,
                value: Some(value),
            });
            Handle::new(slot, 1)
        }
    }

    /// Resolve a handle; `None` for unknown, freed, or stale-generation
    /// handles.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        let s = self.slots.get(handle.slot() as usize)?;
        if s.generation != handle.generation() {
            return None;
        }
        s.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let s = self.slots.get_mut(handle.slot() as usize)?;
        if s.generation != handle.generation() {
            return None;
        }
        s.value.as_mut()
    }

    /// Remove and return the value. Idempotent: a second removal of the same
    /// handle is a no-op returning `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let s = self.slots.get_mut(handle.slot() as usize)?;
        if s.generation != handle.generation() {
            return None;
        }
        let value = s.value.take()?;
        s.generation = s.generation.wrapping_add(1).max(1);
        self.free.push(handle.slot());
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_handles_are_distinct() {
        let mut t = SlotTable::new();
        let a = t.insert("a");
        let b = t.insert("b");
        let c = t.insert("c");
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(!a.is_none());
        assert_eq!(t.get(b), Some(&"b"));
    }

    #[test]
    fn stale_handle_rejected_after_slot_reuse() {
        let mut t = SlotTable::new();
        let a = t.insert("a");
        assert_eq!(t.remove(a), Some("a"));

        // Slot is reused, generation differs.
        let b = t.insert("b");
        assert_ne!(a, b);
        assert!(t.get(a).is_none());
        assert_eq!(t.get(b), Some(&"b"));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut t = SlotTable::new();
        let a = t.insert(1);
        assert_eq!(t.remove(a), Some(1));
        assert_eq!(t.remove(a), None);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn none_sentinel_never_resolves() {
        let mut t = SlotTable::new();
        t.insert("x");
        assert!(t.get(Handle::NONE).is_none());
    }
}
