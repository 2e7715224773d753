//! Listener-side cache of stock counts.
//!
//! Events may arrive late, twice, or out of order. Every item event carries
//! the revision of the store write it announces, and per key the cache only
//! moves forward in revision order, so replays are harmless and an older
//! write can never overwrite a newer one. A full invalidation re-reads the
//! store and raises the floor for every key to the revision it read.

use std::collections::BTreeMap;

use crate::sync::StateReader;
use crate::types::{
    ItemId, Revision, StockLevel, StockQuantity, StockState, UpdateEvent, UpdateTarget,
};

#[derive(Debug, Clone, Default)]
pub struct InventoryView {
    entries: BTreeMap<ItemId, (StockQuantity, Revision)>,
    // revision of the last full read; applies to keys with no entry too
    floor: Revision,
}

impl InventoryView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: &StockState, revision: Revision) -> Self {
        let mut view = Self::new();
        view.replace(state, revision);
        view
    }

    /// Seeds a view from the current contents of the store.
    pub fn load(reader: &StateReader) -> Self {
        let (state, revision) = reader.get_state_with_revision();
        Self::from_state(&state, revision)
    }

    pub fn apply(&mut self, event: &UpdateEvent, reader: &StateReader) {
        match &event.target {
            UpdateTarget::Item {
                item_id,
                quantity,
                revision,
            } => {
                self.apply_item(item_id, *quantity, *revision);
            }
            UpdateTarget::All => {
                let (state, revision) = reader.get_state_with_revision();
                self.replace(&state, revision);
            }
        }
    }

    /// Applies a single-key delta. Returns whether the cache changed.
    pub fn apply_item(
        &mut self,
        item_id: &ItemId,
        quantity: StockQuantity,
        revision: Revision,
    ) -> bool {
        let seen = self
            .entries
            .get(item_id)
            .map_or(self.floor, |(_, seen)| *seen);
        // equal means this very write was already applied or read
        if revision <= seen {
            return false;
        }
        let previous = self.entries.insert(item_id.clone(), (quantity, revision));
        previous.map(|(qty, _)| qty) != Some(quantity)
    }

    pub fn quantity(&self, item_id: &str) -> Option<StockQuantity> {
        self.entries.get(item_id).map(|(qty, _)| *qty)
    }

    pub fn level(&self, item_id: &str) -> Option<StockLevel> {
        self.quantity(item_id).map(StockLevel::of)
    }

    pub fn snapshot(&self) -> StockState {
        self.entries
            .iter()
            .map(|(id, (qty, _))| (id.clone(), *qty))
            .collect()
    }

    // Everything applied so far was committed before this read started, so
    // the read reflects it even when the record was removed in between.
    fn replace(&mut self, state: &StockState, revision: Revision) {
        let newest_applied = self
            .entries
            .values()
            .map(|(_, seen)| *seen)
            .max()
            .unwrap_or(0);
        self.floor = self.floor.max(revision).max(newest_applied);
        self.entries = state
            .iter()
            .map(|(id, qty)| (id.clone(), (qty, self.floor)))
            .collect();
    }
}
