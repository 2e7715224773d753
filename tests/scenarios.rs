use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{Receiver, unbounded};
use parking_lot::Mutex;
use sled::open;
use stock_sync::{
    BootstrapOutcome, BootstrapPolicy, DebugPanel, InventoryView, StockState, StockSync,
    SyncConfig, SyncPhase, UpdateEvent, store::SharedStore,
};

use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

const WAIT: Duration = Duration::from_secs(3);

// Sled holds a file lock, so every context in a test shares one handle to a
// fresh database under a temp dir.
fn shared_db(name: &str) -> anyhow::Result<(TempDir, Arc<sled::Db>)> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(name))?;
    Ok((temp_dir, Arc::new(db)))
}

fn state(items: &[(&str, u64)]) -> StockState {
    items.iter().map(|(id, qty)| (*id, *qty)).collect()
}

// forward every event a context sees into a channel the test can block on
fn record(sync: &StockSync) -> (stock_sync::Subscription, Receiver<UpdateEvent>) {
    let (tx, rx) = unbounded();
    let sub = sync.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });
    (sub, rx)
}

// skip full invalidations, return the next single-item update
fn next_item_event(events: &Receiver<UpdateEvent>) -> Option<UpdateEvent> {
    let deadline = Instant::now() + WAIT;
    while let Ok(event) = events.recv_deadline(deadline) {
        if !event.is_full_invalidation() {
            return Some(event);
        }
    }
    None
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn update_in_one_context_reaches_another() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("scenario.db")?;

    let a = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    assert_eq!(a.bootstrap(&state(&[("x", 5)])), BootstrapOutcome::Seeded);

    // B starts after A has seeded, so it adopts A's numbers
    let b = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    assert_eq!(b.bootstrap(&state(&[("x", 99)])), BootstrapOutcome::Adopted);
    assert_eq!(b.get_state(), state(&[("x", 5)]));

    let (_sub, events) = record(&b);
    a.update_item("x", 4);

    let event = events
        .recv_timeout(WAIT)
        .context("B never heard about A's update")?;
    assert_eq!(event.item_id().map(|id| id.as_str()), Some("x"));
    assert_eq!(event.quantity(), Some(4));
    assert_eq!(b.get_state(), state(&[("x", 4)]));
    assert_eq!(b.phase(), SyncPhase::Synchronized);

    Ok(())
}

#[test]
fn adopting_ignores_desired_defaults() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("adopt.db")?;

    let first = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    first.bootstrap(&state(&[("1", 7)]));

    let second = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    let outcome = second.bootstrap(&state(&[("1", 10), ("2", 3)]));

    assert_eq!(outcome, BootstrapOutcome::Adopted);
    assert_eq!(second.phase(), SyncPhase::Adopted);
    // keys only present in the desired state are not merged in
    assert_eq!(second.get_state(), state(&[("1", 7)]));

    Ok(())
}

#[test]
fn negative_quantity_is_clamped() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("clamp.db")?;
    let sync = StockSync::open(db, SyncConfig::default())?;
    sync.bootstrap(&state(&[("id", 3)]));

    sync.update_item("id", -5);

    assert_eq!(sync.get_state().get("id"), Some(0));
    Ok(())
}

#[test]
fn own_writes_are_delivered_exactly_once() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("echo.db")?;
    let sync = StockSync::open(db, SyncConfig::default())?;
    sync.bootstrap(&state(&[("x", 1)]));

    let (_sub, events) = record(&sync);
    sync.update_item("x", 2);

    // the local echo is synchronous
    assert_eq!(events.try_recv()?.quantity(), Some(2));
    // and nothing comes back through the signal channel
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    Ok(())
}

#[test]
fn signal_records_are_removed_after_grace_period() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("cleanup.db")?;
    let sync = StockSync::open(db, SyncConfig::default())?;
    let panel = DebugPanel::new(&sync);
    sync.bootstrap(&StockState::new());

    sync.update_item("x", 1);
    assert_eq!(panel.pending_signals(), 1);

    assert!(wait_until(|| panel.pending_signals() == 0));
    // the state record itself is untouched
    assert_eq!(sync.get_state().get("x"), Some(1));
    Ok(())
}

#[test]
fn raw_state_write_is_a_full_invalidation() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("raw.db")?;
    let sync = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    sync.bootstrap(&state(&[("x", 5), ("y", 1)]));

    let reader = sync.reader();
    let view = Arc::new(Mutex::new(InventoryView::load(&reader)));
    let _sub = {
        let view = Arc::clone(&view);
        sync.subscribe(move |event| view.lock().apply(event, &reader))
    };

    // a producer that bypasses the signal protocol and overwrites the record
    let config = SyncConfig::default();
    let legacy = SharedStore::new(
        db.open_tree(&config.tree)?,
        &config.state_key,
        &config.signal_prefix,
        "legacy_writer".into(),
    );
    legacy.write(&state(&[("x", 2), ("z", 9)]))?;

    assert!(wait_until(|| view.lock().snapshot() == state(&[("x", 2), ("z", 9)])));
    assert_eq!(view.lock().quantity("y"), None);
    Ok(())
}

#[test]
fn malformed_signal_is_dropped() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("malformed.db")?;
    let config = SyncConfig::default();
    let a = StockSync::open(Arc::clone(&db), config.clone())?;
    let b = StockSync::open(Arc::clone(&db), config.clone())?;
    let (_sub, events) = record(&b);
    a.bootstrap(&state(&[("x", 5)]));
    b.bootstrap(&StockState::new());

    // drain the full invalidation caused by A's seed
    let seed = events.recv_timeout(WAIT)?;
    assert!(seed.is_full_invalidation());

    let tree = db.open_tree(&config.tree)?;
    tree.insert(format!("{}garbage", config.signal_prefix), vec![0xff, 0x00])?;
    a.update_item("x", 6);

    // garbage was observed first and dropped; the next event is A's update
    let event = events.recv_timeout(WAIT)?;
    assert_eq!(event.quantity(), Some(6));
    assert_eq!(b.get_state().get("x"), Some(6));
    Ok(())
}

#[test]
fn seeding_invalidates_contexts_already_running() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("late_seed.db")?;
    let waiting = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    let (_sub, events) = record(&waiting);

    let seeder = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    seeder.bootstrap(&state(&[("x", 5)]));

    let event = events.recv_timeout(WAIT)?;
    assert!(event.is_full_invalidation());
    assert_eq!(waiting.get_state(), state(&[("x", 5)]));
    Ok(())
}

#[test]
fn compare_and_set_bootstrap_has_one_seeder() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("cas.db")?;
    let config = SyncConfig {
        bootstrap_policy: BootstrapPolicy::CompareAndSet,
        ..SyncConfig::default()
    };

    let contexts = 4;
    let barrier = Arc::new(Barrier::new(contexts));
    let handles: Vec<_> = (0..contexts as u64)
        .map(|n| {
            let db = Arc::clone(&db);
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> anyhow::Result<(BootstrapOutcome, StockState)> {
                let sync = StockSync::open(db, config)?;
                let desired = state(&[("x", n)]);
                barrier.wait();
                Ok((sync.bootstrap(&desired), desired))
            })
        })
        .collect();

    let mut seeded = Vec::new();
    for handle in handles {
        let (outcome, desired) = handle.join().expect("bootstrap thread panicked")?;
        if outcome == BootstrapOutcome::Seeded {
            seeded.push(desired);
        }
    }

    assert_eq!(seeded.len(), 1);
    let check = StockSync::open(db, config)?;
    assert_eq!(check.get_state(), seeded[0]);
    Ok(())
}

#[test]
fn concurrent_last_write_wins_bootstrap_keeps_one_seed() -> anyhow::Result<()> {
    // Both contexts may seed. Whatever happens, the store ends up holding
    // exactly one of the desired states, never a merge.
    let (_dir, db) = shared_db("lww.db")?;
    let barrier = Arc::new(Barrier::new(2));
    let desired = [state(&[("x", 1)]), state(&[("y", 2)])];

    let handles: Vec<_> = desired
        .iter()
        .cloned()
        .map(|want| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> anyhow::Result<BootstrapOutcome> {
                let sync = StockSync::open(db, SyncConfig::default())?;
                barrier.wait();
                Ok(sync.bootstrap(&want))
            })
        })
        .collect();

    let outcomes = handles
        .into_iter()
        .map(|handle| handle.join().expect("bootstrap thread panicked"))
        .collect::<anyhow::Result<Vec<_>>>()?;
    assert!(outcomes.contains(&BootstrapOutcome::Seeded));

    let check = StockSync::open(db, SyncConfig::default())?;
    let stored = check.get_state();
    assert!(desired.contains(&stored), "unexpected store contents {stored:?}");
    Ok(())
}

#[test]
fn debug_clear_resets_every_context() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("clear.db")?;
    let a = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    a.bootstrap(&state(&[("x", 5)]));
    // B starts after the seed, so the only invalidation it can see is the clear
    let b = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    b.bootstrap(&StockState::new());

    let (_sub_a, events_a) = record(&a);
    let (_sub_b, events_b) = record(&b);

    let panel = DebugPanel::new(&a);
    assert_eq!(panel.lines(), vec!["Product x: 5 units".to_string()]);
    panel.clear_all()?;

    let saw_clear = |events: &Receiver<UpdateEvent>| {
        let deadline = Instant::now() + WAIT;
        while let Ok(event) = events.recv_deadline(deadline) {
            if event.is_full_invalidation() {
                return true;
            }
        }
        false
    };
    assert!(saw_clear(&events_a));
    assert!(saw_clear(&events_b));
    assert!(b.get_state().is_empty());
    assert_eq!(panel.lines(), vec!["No inventory state saved".to_string()]);
    Ok(())
}

#[test]
fn unsubscribed_listener_stops_receiving() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("unsub.db")?;
    let sync = StockSync::open(db, SyncConfig::default())?;
    sync.bootstrap(&StockState::new());

    let (sub, events) = record(&sync);
    sync.update_item("x", 1);
    sub.unsubscribe();
    sync.update_item("x", 2);

    assert_eq!(events.try_iter().count(), 1);
    Ok(())
}

#[test]
fn store_survives_reopen() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let path = temp_dir.path().join("durable.db");

    {
        let db = Arc::new(open(&path)?);
        let sync = StockSync::open(db, SyncConfig::default())?;
        sync.bootstrap(&state(&[("x", 5)]));
        sync.update_item("x", 3);
    }

    let db = Arc::new(open(&path)?);
    let sync = StockSync::open(db, SyncConfig::default())?;
    assert_eq!(sync.bootstrap(&state(&[("x", 50)])), BootstrapOutcome::Adopted);
    assert_eq!(sync.get_state().get("x"), Some(3));
    Ok(())
}

#[test]
fn clear_on_empty_store_keeps_peers_listening() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("empty_clear.db")?;
    let a = StockSync::open(Arc::clone(&db), SyncConfig::default())?;
    let b = StockSync::open(Arc::clone(&db), SyncConfig::default())?;

    // nothing to remove, every removal here is a no-op write
    assert_eq!(DebugPanel::new(&a).clear_all()?, 0);
    a.bootstrap(&StockState::new());
    b.bootstrap(&StockState::new());

    let (_sub, events) = record(&b);
    a.update_item("x", 4);

    let event = next_item_event(&events).context("B stopped listening after the clear")?;
    assert_eq!(event.quantity(), Some(4));
    Ok(())
}

#[test]
fn late_reap_of_cleared_signal_keeps_peers_listening() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("late_reap.db")?;
    let config = SyncConfig {
        grace_period_ms: 100,
        ..SyncConfig::default()
    };
    let a = StockSync::open(Arc::clone(&db), config.clone())?;
    let b = StockSync::open(Arc::clone(&db), config)?;
    a.bootstrap(&StockState::new());
    b.bootstrap(&StockState::new());

    let (_sub, events) = record(&b);
    a.update_item("x", 1);
    // removes the signal record before the reaper gets to it
    DebugPanel::new(&a).clear_all()?;
    assert!(wait_until(|| DebugPanel::new(&a).pending_signals() == 0));
    thread::sleep(Duration::from_millis(300));

    a.update_item("x", 2);

    let mut last = None;
    while let Some(event) = next_item_event(&events) {
        last = event.quantity();
        if last == Some(2) {
            break;
        }
    }
    assert_eq!(last, Some(2));
    Ok(())
}

#[test]
fn concurrent_writers_converge() -> anyhow::Result<()> {
    let (_dir, db) = shared_db("concurrent.db")?;
    let config = SyncConfig {
        grace_period_ms: 50,
        ..SyncConfig::default()
    };
    let contexts = 4;
    let rounds = 150;

    let mut views = Vec::new();
    let mut syncs = Vec::new();
    for _ in 0..contexts {
        let sync = StockSync::open(Arc::clone(&db), config.clone())?;
        sync.bootstrap(&state(&[("a", 1), ("b", 1), ("c", 1)]));
        let reader = sync.reader();
        let view = Arc::new(Mutex::new(InventoryView::load(&reader)));
        let sub = {
            let view = Arc::clone(&view);
            sync.subscribe(move |event| view.lock().apply(event, &reader))
        };
        views.push((view, sub));
        syncs.push(sync);
    }

    thread::scope(|scope| {
        for (n, sync) in syncs.iter().enumerate() {
            scope.spawn(move || {
                for round in 0..rounds {
                    let item = ["a", "b", "c"][(round + n) % 3];
                    if round % 4 == 0 {
                        sync.adjust_item(item, -1);
                    } else {
                        sync.update_item(item, (n * 1000 + round) as i64);
                    }
                }
            });
        }
    });

    let store = syncs[0].get_state();
    let converged = wait_until(|| views.iter().all(|(view, _)| view.lock().snapshot() == store));
    for (n, (view, _)) in views.iter().enumerate() {
        assert_eq!(view.lock().snapshot(), store, "context {n} did not converge");
    }
    assert!(converged);
    Ok(())
}
