//! Change signal channel.
//!
//! A writer announces a change by inserting a short-lived signal record next
//! to the state record. Every other context watches the tree and turns those
//! inserts into [`UpdateEvent`]s. Records written by the watching context
//! itself are skipped, so a context never observes its own writes here.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use minicbor::{Decode, Encode};
use sled::Tree;

use crate::error::{SyncResult, encode_error};
use crate::store::StateRecord;
use crate::types::{ContextId, UpdateEvent};
use crate::utils::{new_signal_key, new_watch_stop_key};

/// Payload of a signal record.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SignalEnvelope {
    #[n(0)]
    pub origin: ContextId,
    #[n(1)]
    pub event: UpdateEvent,
}

/// What one observed tree change means to the watching context.
#[derive(Debug, PartialEq)]
pub enum Observed {
    Update(UpdateEvent),
    Ignored,
    Malformed(String),
}

/// Key layout shared by every context on the same tree.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    pub state_key: Vec<u8>,
    pub signal_prefix: Vec<u8>,
}

impl KeyLayout {
    pub fn new(state_key: &str, signal_prefix: &str) -> Self {
        Self {
            state_key: state_key.as_bytes().to_vec(),
            signal_prefix: signal_prefix.as_bytes().to_vec(),
        }
    }

    /// Classifies a change seen by `observer`. `value` is `None` for removals.
    pub fn classify(&self, observer: &ContextId, key: &[u8], value: Option<&[u8]>) -> Observed {
        if key.starts_with(&self.signal_prefix) {
            let Some(bytes) = value else {
                return Observed::Ignored;
            };
            return match minicbor::decode::<SignalEnvelope>(bytes) {
                Ok(envelope) if &envelope.origin == observer => Observed::Ignored,
                Ok(envelope) => Observed::Update(envelope.event),
                Err(err) => Observed::Malformed(err.to_string()),
            };
        }

        if key == self.state_key.as_slice() {
            let Some(bytes) = value else {
                // removal carries no writer, every context refreshes
                return Observed::Update(UpdateEvent::all());
            };
            return match StateRecord::decode(bytes) {
                Ok(record) if &record.writer == observer || record.signaled => Observed::Ignored,
                Ok(_) => Observed::Update(UpdateEvent::all()),
                Err(err) => Observed::Malformed(err.to_string()),
            };
        }

        Observed::Ignored
    }
}

struct PendingRemoval {
    key: Vec<u8>,
    due: Instant,
}

/// Emitting half of the channel, one per context.
pub struct SignalChannel {
    tree: Tree,
    prefix: String,
    origin: ContextId,
    grace_period: Duration,
    reaper: Option<Sender<PendingRemoval>>,
    reaper_handle: Option<JoinHandle<()>>,
}

impl SignalChannel {
    pub fn new(
        tree: Tree,
        prefix: &str,
        origin: ContextId,
        grace_period: Duration,
    ) -> SyncResult<Self> {
        let (reaper, pending) = crossbeam_channel::unbounded();
        let reaper_handle = spawn_reaper(tree.clone(), pending)?;

        Ok(Self {
            tree,
            prefix: prefix.to_string(),
            origin,
            grace_period,
            reaper: Some(reaper),
            reaper_handle: Some(reaper_handle),
        })
    }

    /// Publishes `event` under a fresh signal key and schedules its removal.
    pub fn emit(&self, event: &UpdateEvent) -> SyncResult<String> {
        let key = new_signal_key(&self.prefix, event.emitted_at.as_nanos());
        let envelope = SignalEnvelope {
            origin: self.origin.clone(),
            event: event.clone(),
        };
        let bytes = minicbor::to_vec(&envelope).map_err(encode_error)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        debug!("event=signal_emit module=signal status=ok origin={} key={key}", self.origin);

        let removal = PendingRemoval {
            key: key.as_bytes().to_vec(),
            due: Instant::now() + self.grace_period,
        };
        let queued = self
            .reaper
            .as_ref()
            .is_some_and(|reaper| reaper.send(removal).is_ok());
        if !queued {
            warn!("event=signal_reap module=signal status=skipped key={key} reason=reaper_gone");
        }
        Ok(key)
    }
}

impl Drop for SignalChannel {
    // Closing the queue lets the reaper finish what is pending, which takes at
    // most one grace period, and release its handle on the tree.
    fn drop(&mut self) {
        self.reaper.take();
        if let Some(handle) = self.reaper_handle.take() {
            if handle.join().is_err() {
                error!("event=signal_reap module=signal status=error reason=reaper_panicked");
            }
        }
    }
}

// Removals are queued in emit order with a fixed grace period, so due times
// are non-decreasing and a FIFO is enough.
fn spawn_reaper(tree: Tree, pending: Receiver<PendingRemoval>) -> SyncResult<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("stock-sync-reaper".into())
        .spawn(move || {
            while let Ok(removal) = pending.recv() {
                let wait = removal.due.saturating_duration_since(Instant::now());
                if !wait.is_zero() {
                    thread::sleep(wait);
                }
                if let Err(err) = tree.remove(&removal.key) {
                    warn!(
                        "event=signal_reap module=signal status=error key={} error={err}",
                        String::from_utf8_lossy(&removal.key)
                    );
                }
            }
        })?;
    Ok(handle)
}

/// Receiving half: a thread draining a sled subscriber for one context.
///
/// The thread blocks on the subscriber and only exits when it sees its own
/// stop key inserted, so shutdown writes that key and joins.
pub struct SignalWatcher {
    tree: Tree,
    stop_key: Vec<u8>,
    handle: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Registers the subscription before returning, so any write that happens
    /// after `spawn` is observed.
    pub fn spawn<F>(
        tree: &Tree,
        layout: KeyLayout,
        observer: ContextId,
        deliver: F,
    ) -> SyncResult<Self>
    where
        F: Fn(UpdateEvent) + Send + 'static,
    {
        let subscriber = tree.watch_prefix(Vec::<u8>::new());
        let stop_key = new_watch_stop_key(&layout.state_key, observer.as_str());
        let exit_key = stop_key.clone();
        let name = format!("stock-sync-watch-{observer}");

        let handle = thread::Builder::new().name(name).spawn(move || {
            info!("event=watch_start module=signal status=ok context={observer}");
            // the iterator skips aborted reservations and no-op writes
            for change in subscriber {
                let (key, value) = match &change {
                    sled::Event::Insert { key, value } => (&key[..], Some(&value[..])),
                    sled::Event::Remove { key } => (&key[..], None),
                };
                if value.is_some() && key == exit_key.as_slice() {
                    info!("event=watch_stop module=signal status=ok context={observer}");
                    return;
                }
                match layout.classify(&observer, key, value) {
                    Observed::Update(event) => deliver(event),
                    Observed::Ignored => {}
                    Observed::Malformed(reason) => {
                        warn!(
                            "event=signal_decode module=signal status=dropped context={observer} key={} error={reason}",
                            String::from_utf8_lossy(key)
                        );
                    }
                }
            }
            error!(
                "event=watch_stop module=signal status=error context={observer} reason=subscriber_closed"
            );
        })?;

        Ok(Self {
            tree: tree.clone(),
            stop_key,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(err) = self.tree.insert(&self.stop_key, Vec::<u8>::new()) {
            // without the stop key the thread never wakes, leave it detached
            error!("event=watch_stop module=signal status=error reason=stop_write_failed error={err}");
            return;
        }
        if handle.join().is_err() {
            error!("event=watch_stop module=signal status=error reason=watcher_panicked");
        }
        if let Err(err) = self.tree.remove(&self.stop_key) {
            warn!("event=watch_stop module=signal status=error reason=stop_cleanup_failed error={err}");
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
