//! Sync orchestrator: the only surface application code talks to.
//!
//! One [`StockSync`] is constructed per execution context at startup and
//! dropped at shutdown. Contexts sharing a store each hold a clone of the same
//! `Arc<sled::Db>`.
//!
//! Every public operation succeeds from the caller's point of view. Store and
//! codec failures are logged and contained; the `try_` variants expose them.
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::bus::{EventBus, Subscription};
use crate::config::{BootstrapPolicy, SyncConfig};
use crate::error::SyncResult;
use crate::signal::{KeyLayout, SignalChannel, SignalWatcher};
use crate::store::SharedStore;
use crate::types::{
    ContextId, ItemId, Revision, StockQuantity, StockState, UpdateEvent, apply_delta,
    clamp_quantity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The store was empty and this context wrote its desired state.
    Seeded,
    /// The store already held state and this context took it as is.
    Adopted,
}

/// Per-context lifecycle. There is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    Seeded,
    Adopted,
    Synchronized,
}

/// Read-only view of the shared state, for listeners that need a full re-read.
#[derive(Clone)]
pub struct StateReader {
    store: SharedStore,
}

impl StateReader {
    pub fn get_state(&self) -> StockState {
        read_or_empty(&self.store)
    }

    /// Full state together with the revision of the write that produced it.
    pub fn get_state_with_revision(&self) -> (StockState, Revision) {
        self.store.read_with_revision().unwrap_or_else(|err| {
            error!("event=read_state module=sync status=error error={err}");
            (StockState::new(), 0)
        })
    }
}

pub struct StockSync {
    context_id: ContextId,
    config: SyncConfig,
    store: SharedStore,
    signals: SignalChannel,
    bus: EventBus,
    phase: Arc<Mutex<SyncPhase>>,
    outcome: Mutex<Option<BootstrapOutcome>>,
    // dropped last, joins the watcher thread
    _watcher: SignalWatcher,
}

impl StockSync {
    pub fn open(db: Arc<sled::Db>, config: SyncConfig) -> SyncResult<Self> {
        Self::open_as(db, config, ContextId::generate()?)
    }

    /// Opens a context with a caller-chosen identity.
    pub fn open_as(db: Arc<sled::Db>, config: SyncConfig, context_id: ContextId) -> SyncResult<Self> {
        config.validate()?;
        let tree = db.open_tree(&config.tree)?;
        let store = SharedStore::new(
            tree.clone(),
            &config.state_key,
            &config.signal_prefix,
            context_id.clone(),
        );
        let signals = SignalChannel::new(
            tree.clone(),
            &config.signal_prefix,
            context_id.clone(),
            config.grace_period(),
        )?;

        let bus = EventBus::new();
        let phase = Arc::new(Mutex::new(SyncPhase::Uninitialized));
        let watcher = {
            let bus = bus.clone();
            let phase = Arc::clone(&phase);
            SignalWatcher::spawn(
                &tree,
                KeyLayout::new(&config.state_key, &config.signal_prefix),
                context_id.clone(),
                move |event| deliver(&bus, &phase, &event),
            )?
        };

        info!(
            "event=context_open module=sync status=ok context={context_id} tree={} policy={:?}",
            config.tree, config.bootstrap_policy
        );

        Ok(Self {
            context_id,
            config,
            store,
            signals,
            bus,
            phase,
            outcome: Mutex::new(None),
            _watcher: watcher,
        })
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn bootstrap_outcome(&self) -> Option<BootstrapOutcome> {
        *self.outcome.lock()
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            store: self.store.clone(),
        }
    }

    pub(crate) fn shared_store(&self) -> &SharedStore {
        &self.store
    }

    pub fn get_state(&self) -> StockState {
        read_or_empty(&self.store)
    }

    pub fn try_get_state(&self) -> SyncResult<StockState> {
        self.store.read()
    }

    /// Seeds the store with `desired` if it is empty, otherwise adopts what is
    /// stored. Adoption ignores `desired` entirely, including keys the store
    /// lacks. Runs once; later calls return the first outcome.
    ///
    /// Under [`BootstrapPolicy::LastWriteWins`] two contexts bootstrapping at
    /// the same moment may both see an empty store and both seed. The later
    /// write wins and the other context keeps believing its own numbers until
    /// the next update event reaches it.
    pub fn bootstrap(&self, desired: &StockState) -> BootstrapOutcome {
        let mut outcome = self.outcome.lock();
        if let Some(done) = *outcome {
            debug!(
                "event=bootstrap module=sync status=skipped context={} outcome={done:?}",
                self.context_id
            );
            return done;
        }

        let decided = match self.decide_bootstrap(desired) {
            Ok(decided) => decided,
            Err(err) => {
                error!(
                    "event=bootstrap module=sync status=error context={} error={err}",
                    self.context_id
                );
                BootstrapOutcome::Adopted
            }
        };

        *self.phase.lock() = match decided {
            BootstrapOutcome::Seeded => SyncPhase::Seeded,
            BootstrapOutcome::Adopted => SyncPhase::Adopted,
        };
        *outcome = Some(decided);
        info!(
            "event=bootstrap module=sync status=ok context={} outcome={decided:?}",
            self.context_id
        );
        decided
    }

    /// Bootstraps with the configured `initial_inventory`.
    pub fn bootstrap_from_config(&self) -> BootstrapOutcome {
        let desired = self.config.initial_state();
        self.bootstrap(&desired)
    }

    fn decide_bootstrap(&self, desired: &StockState) -> SyncResult<BootstrapOutcome> {
        match self.config.bootstrap_policy {
            BootstrapPolicy::LastWriteWins => {
                if self.store.read()?.is_empty() {
                    self.store.write(desired)?;
                    Ok(BootstrapOutcome::Seeded)
                } else {
                    Ok(BootstrapOutcome::Adopted)
                }
            }
            BootstrapPolicy::CompareAndSet => {
                if self.store.seed_if_absent(desired)? {
                    Ok(BootstrapOutcome::Seeded)
                } else {
                    Ok(BootstrapOutcome::Adopted)
                }
            }
        }
    }

    /// Sets `item_id` to `quantity`, clamped at zero. Other contexts learn
    /// through the signal channel; this context's listeners are called before
    /// the method returns.
    pub fn update_item(&self, item_id: impl Into<ItemId>, quantity: i64) {
        let item_id = item_id.into();
        if let Err(err) = self.try_update_item(item_id.clone(), quantity) {
            error!(
                "event=update_item module=sync status=error context={} item={item_id} error={err}",
                self.context_id
            );
        }
    }

    pub fn try_update_item(
        &self,
        item_id: impl Into<ItemId>,
        quantity: i64,
    ) -> SyncResult<UpdateEvent> {
        let quantity = clamp_quantity(quantity);
        self.set_quantity(item_id.into(), |_| quantity)
            .map(|(_, event)| event)
    }

    /// Adds `delta` to the stored quantity, saturating at zero. Returns the new
    /// quantity, or the last known one if the write failed.
    pub fn adjust_item(&self, item_id: impl Into<ItemId>, delta: i64) -> StockQuantity {
        let item_id = item_id.into();
        match self.try_adjust_item(item_id.clone(), delta) {
            Ok(quantity) => quantity,
            Err(err) => {
                error!(
                    "event=adjust_item module=sync status=error context={} item={item_id} error={err}",
                    self.context_id
                );
                self.get_state().get(item_id.as_str()).unwrap_or(0)
            }
        }
    }

    pub fn try_adjust_item(
        &self,
        item_id: impl Into<ItemId>,
        delta: i64,
    ) -> SyncResult<StockQuantity> {
        self.set_quantity(item_id.into(), |current| apply_delta(current, delta))
            .map(|(quantity, _)| quantity)
    }

    // `next` maps the quantity stored at commit time to the new one, so a
    // delta is never applied to a value another context already replaced
    fn set_quantity(
        &self,
        item_id: ItemId,
        next: impl Fn(StockQuantity) -> StockQuantity,
    ) -> SyncResult<(StockQuantity, UpdateEvent)> {
        let (quantity, revision) = self.store.modify(|items| {
            let quantity = next(items.get(item_id.as_str()).unwrap_or(0));
            items.insert(item_id.clone(), quantity);
            quantity
        })?;

        let event = UpdateEvent::item(item_id, quantity, revision);
        if let Err(err) = self.signals.emit(&event) {
            warn!(
                "event=signal_emit module=sync status=error context={} error={err}",
                self.context_id
            );
        }
        deliver(&self.bus, &self.phase, &event);
        debug!(
            "event=update_item module=sync status=ok context={} target={:?}",
            self.context_id, event.target
        );
        Ok((quantity, event))
    }

    /// Registers `callback` for every update this context sees, local or
    /// remote. Callbacks run on the thread that produced the event: the caller
    /// of `update_item` for local writes, the watcher thread otherwise.
    ///
    /// A callback must not hold a strong reference to this `StockSync`.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }
}

fn deliver(bus: &EventBus, phase: &Mutex<SyncPhase>, event: &UpdateEvent) {
    {
        let mut phase = phase.lock();
        if *phase != SyncPhase::Uninitialized {
            *phase = SyncPhase::Synchronized;
        }
    }
    bus.publish(event);
}

fn read_or_empty(store: &SharedStore) -> StockState {
    store.read().unwrap_or_else(|err| {
        error!("event=read_state module=sync status=error error={err}");
        StockState::new()
    })
}
