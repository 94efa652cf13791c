use dashmap::DashMap;
use types::primitives::{Slot, H256};

/// State roots announced by head events for epoch boundary slots.
///
/// An entry is consumed by the first lookup for its slot.
/// Storing a root for a slot that already has one replaces it.
#[derive(Default)]
pub struct EpochBoundaryCache {
    roots: DashMap<Slot, H256>,
}

impl EpochBoundaryCache {
    pub fn set(&self, slot: Slot, root: H256) {
        self.roots.insert(slot, root);
    }

    pub fn take(&self, slot: Slot) -> Option<H256> {
        self.roots.remove(&slot).map(|(_, root)| root)
    }

    /// Forgets roots announced for slots before `slot` that were never looked up.
    pub fn prune_below(&self, slot: Slot) {
        self.roots.retain(|cached_slot, _| *cached_slot >= slot);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }
}
