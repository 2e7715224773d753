//! Durable shared store adapter.
//!
//! The whole stock mapping lives under one key of a sled tree and is only
//! ever replaced wholesale. Every write carries a fresh [`Revision`], taken
//! inside a compare-and-swap loop so that revision order is write order.

use log::{debug, info};
use minicbor::{Decode, Encode};
use sled::Tree;

use crate::error::{SyncResult, encode_error};
use crate::types::{ContextId, Revision, StockState, TimeStamp, next_revision};

/// Persisted layout of the state key.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StateRecord {
    #[n(0)]
    pub writer: ContextId,
    // true when a dedicated signal record follows this write
    #[n(1)]
    pub signaled: bool,
    #[n(2)]
    pub written_at: TimeStamp,
    #[n(3)]
    pub items: StockState,
    #[n(4)]
    pub revision: Revision,
}

impl StateRecord {
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Ok(minicbor::decode(bytes)?)
    }
}

#[derive(Clone)]
pub struct SharedStore {
    tree: Tree,
    state_key: Vec<u8>,
    signal_prefix: Vec<u8>,
    writer: ContextId,
}

impl SharedStore {
    pub fn new(tree: Tree, state_key: &str, signal_prefix: &str, writer: ContextId) -> Self {
        Self {
            tree,
            state_key: state_key.as_bytes().to_vec(),
            signal_prefix: signal_prefix.as_bytes().to_vec(),
            writer,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn state_key(&self) -> &[u8] {
        &self.state_key
    }

    /// Current full mapping, empty when nothing has been written yet.
    pub fn read(&self) -> SyncResult<StockState> {
        Ok(self
            .read_record()?
            .map(|record| record.items)
            .unwrap_or_default())
    }

    /// Current mapping with the revision that produced it, `0` when absent.
    pub fn read_with_revision(&self) -> SyncResult<(StockState, Revision)> {
        Ok(self
            .read_record()?
            .map(|record| (record.items, record.revision))
            .unwrap_or_default())
    }

    pub fn read_record(&self) -> SyncResult<Option<StateRecord>> {
        match self.tree.get(&self.state_key)? {
            Some(bytes) => Ok(Some(StateRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replaces the stored mapping. Other contexts see this as a raw overwrite
    /// and treat it as a full invalidation.
    pub fn write(&self, state: &StockState) -> SyncResult<Revision> {
        let ((), revision) = self.commit(false, |items| *items = state.clone())?;
        Ok(revision)
    }

    /// Applies `change` to the mapping as it is at commit time, ahead of a
    /// signal record carrying the delta. `change` reruns whenever another
    /// writer got in first, so it must not have side effects.
    pub fn modify<R>(
        &self,
        change: impl FnMut(&mut StockState) -> R,
    ) -> SyncResult<(R, Revision)> {
        self.commit(true, change)
    }

    /// Writes `state` only if no state record exists. Returns whether it won.
    pub fn seed_if_absent(&self, state: &StockState) -> SyncResult<bool> {
        let bytes = self.encode(state, false, next_revision(0))?;
        let swapped = self
            .tree
            .compare_and_swap(&self.state_key, None as Option<&[u8]>, Some(bytes))?;

        Ok(swapped.is_ok())
    }

    /// Removes the state record and every signal record. Debug use only.
    pub fn clear(&self) -> SyncResult<usize> {
        let mut removed = 0;
        if self.tree.remove(&self.state_key)?.is_some() {
            removed += 1;
        }
        for entry in self.tree.scan_prefix(&self.signal_prefix) {
            let (key, _) = entry?;
            if self.tree.remove(key)?.is_some() {
                removed += 1;
            }
        }
        info!("event=store_clear module=store status=ok removed={removed}");
        Ok(removed)
    }

    /// Number of signal records still present.
    pub fn pending_signals(&self) -> usize {
        self.tree.scan_prefix(&self.signal_prefix).count()
    }

    fn commit<R>(
        &self,
        signaled: bool,
        mut change: impl FnMut(&mut StockState) -> R,
    ) -> SyncResult<(R, Revision)> {
        loop {
            let current = self.tree.get(&self.state_key)?;
            let (mut items, previous) = match current.as_deref() {
                Some(bytes) => {
                    let record = StateRecord::decode(bytes)?;
                    (record.items, record.revision)
                }
                None => (StockState::new(), 0),
            };
            let outcome = change(&mut items);
            let revision = next_revision(previous);
            let bytes = self.encode(&items, signaled, revision)?;

            if self
                .tree
                .compare_and_swap(&self.state_key, current, Some(bytes))?
                .is_ok()
            {
                debug!(
                    "event=store_write module=store status=ok writer={} items={} signaled={signaled} revision={revision}",
                    self.writer,
                    items.len()
                );
                return Ok((outcome, revision));
            }
            debug!(
                "event=store_write module=store status=retry writer={}",
                self.writer
            );
        }
    }

    fn encode(&self, state: &StockState, signaled: bool, revision: Revision) -> SyncResult<Vec<u8>> {
        let record = StateRecord {
            writer: self.writer.clone(),
            signaled,
            written_at: TimeStamp::new(),
            items: state.clone(),
            revision,
        };
        minicbor::to_vec(&record).map_err(encode_error)
    }
}
