//! Operational surface for manual testing. Not part of the sync contract.

use log::warn;

use crate::error::SyncResult;
use crate::store::SharedStore;
use crate::sync::StockSync;
use crate::types::StockState;

pub struct DebugPanel {
    store: SharedStore,
}

impl DebugPanel {
    pub fn new(sync: &StockSync) -> Self {
        Self {
            store: sync.shared_store().clone(),
        }
    }

    /// Current stored state, read-only.
    pub fn snapshot(&self) -> StockState {
        self.store.read().unwrap_or_else(|err| {
            warn!("event=debug_snapshot module=debug status=error error={err}");
            StockState::new()
        })
    }

    pub fn lines(&self) -> Vec<String> {
        let state = self.snapshot();
        if state.is_empty() {
            return vec!["No inventory state saved".to_string()];
        }
        state
            .iter()
            .map(|(id, qty)| format!("Product {id}: {qty} units"))
            .collect()
    }

    /// Removes the state record and every pending signal record. Every open
    /// context, this one included, receives a full invalidation.
    pub fn clear_all(&self) -> SyncResult<usize> {
        warn!("event=debug_clear module=debug status=start");
        self.store.clear()
    }

    pub fn pending_signals(&self) -> usize {
        self.store.pending_signals()
    }
}
