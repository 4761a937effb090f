use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use serde_json::json;

use kyrowatch::{
    CallbackTable, ChangeFilter, ChangeStreamSource, ChannelInvoker, Delivery, InMemoryChangeStore, Namespace,
    OperationType, WatchConfig, WatchManager, WatcherId,
};

fn config() -> WatchConfig {
    WatchConfig {
        idle_interval_ms: 2,
        ..WatchConfig::default()
    }
}

fn ns(db: &str, coll: &str) -> Namespace {
    Namespace::new(db, coll).unwrap()
}

fn setup() -> (Arc<InMemoryChangeStore>, ChannelInvoker, WatchManager) {
    let store = Arc::new(InMemoryChangeStore::new());
    let invoker = ChannelInvoker::new();
    let source: Arc<dyn ChangeStreamSource> = Arc::clone(&store) as Arc<dyn ChangeStreamSource>;
    let manager = WatchManager::with_config(source, Arc::new(invoker.clone()), config());
    (store, invoker, manager)
}

fn subscribe(invoker: &ChannelInvoker, callback: &str) -> Receiver<Delivery> {
    let (tx, rx) = unbounded();
    invoker.register(callback, tx);
    rx
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

const RECV: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(50);

#[test]
fn watch_delivers_once_and_unwatch_stops_delivery() {
    let (store, invoker, manager) = setup();
    let rx = subscribe(&invoker, "cb1");
    let coll = ns("db", "coll");

    let id = manager.watch_collection("db", "coll", json!({}), "cb1").unwrap();
    assert_eq!(id, WatcherId::new(1));
    assert!(manager.is_running());

    store.insert(&coll, json!({"_id": "D1", "v": 1})).unwrap();
    let delivery = rx.recv_timeout(RECV).unwrap();
    assert_eq!(delivery.watcher_id, id);
    assert_eq!(delivery.callback.as_str(), "cb1");
    assert_eq!(delivery.event.operation_type, OperationType::Insert);
    assert_eq!(delivery.event.full_document, Some(json!({"_id": "D1", "v": 1})));
    assert!(rx.recv_timeout(QUIET).is_err(), "delivered more than once");

    manager.unwatch(id);
    assert!(manager.active_watchers().is_empty());
    assert!(!manager.is_running());
    assert_eq!(store.open_streams(&coll).unwrap(), 0);

    store.insert(&coll, json!({"_id": "D2"})).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn concurrent_watches_on_different_collections_are_isolated() {
    let (store, invoker, manager) = setup();
    let manager = Arc::new(manager);
    let rx_a = subscribe(&invoker, "cbA");
    let rx_b = subscribe(&invoker, "cbB");

    let ma = Arc::clone(&manager);
    let ta = thread::spawn(move || ma.watch(ns("db", "a"), ChangeFilter::match_all(), "cbA").unwrap());
    let mb = Arc::clone(&manager);
    let tb = thread::spawn(move || mb.watch(ns("db", "b"), ChangeFilter::match_all(), "cbB").unwrap());
    let id_a = ta.join().unwrap();
    let id_b = tb.join().unwrap();
    assert_ne!(id_a, id_b);
    assert_eq!(manager.stats().workers_started, 1);

    store.insert(&ns("db", "a"), json!({"_id": "in-a"})).unwrap();
    store.insert(&ns("db", "b"), json!({"_id": "in-b"})).unwrap();

    let got_a = rx_a.recv_timeout(RECV).unwrap();
    let got_b = rx_b.recv_timeout(RECV).unwrap();
    assert_eq!((got_a.watcher_id, got_a.event.document_key), (id_a, json!({"_id": "in-a"})));
    assert_eq!((got_b.watcher_id, got_b.event.document_key), (id_b, json!({"_id": "in-b"})));
    assert!(rx_a.recv_timeout(QUIET).is_err());
    assert!(rx_b.try_recv().is_err());
}

#[test]
fn events_from_one_watcher_arrive_in_cursor_order() {
    let (store, invoker, manager) = setup();
    let rx = subscribe(&invoker, "ordered");
    let coll = ns("db", "coll");
    manager.watch(coll.clone(), ChangeFilter::match_all(), "ordered").unwrap();

    for i in 0..200 {
        store.insert(&coll, json!({"_id": i})).unwrap();
    }

    let keys: Vec<i64> = (0..200)
        .map(|_| rx.recv_timeout(RECV).unwrap().event.document_key["_id"].as_i64().unwrap())
        .collect();
    assert_eq!(keys, (0..200).collect::<Vec<i64>>());
}

#[test]
fn filter_selects_matching_changes_only() {
    let (store, invoker, manager) = setup();
    let rx = subscribe(&invoker, "deletes");
    let coll = ns("db", "coll");
    manager
        .watch(coll.clone(), ChangeFilter::new(json!({"operationType": "delete"})), "deletes")
        .unwrap();

    store.insert(&coll, json!({"_id": 1})).unwrap();
    store.update(&coll, &json!(1), json!({"x": 2})).unwrap();
    store.delete(&coll, &json!(1)).unwrap();

    let d = rx.recv_timeout(RECV).unwrap();
    assert_eq!(d.event.operation_type, OperationType::Delete);
    assert!(d.event.full_document.is_none());
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn stream_error_is_isolated_to_the_failing_watcher() {
    let (store, invoker, manager) = setup();
    let rx_a = subscribe(&invoker, "cbA");
    let rx_b = subscribe(&invoker, "cbB");
    let a = manager.watch(ns("db", "a"), ChangeFilter::match_all(), "cbA").unwrap();
    let b = manager.watch(ns("db", "b"), ChangeFilter::match_all(), "cbB").unwrap();

    store.invalidate(&ns("db", "a")).unwrap();
    assert!(wait_until(|| !manager.is_watching(a)));

    store.insert(&ns("db", "b"), json!({"_id": 1})).unwrap();
    assert_eq!(rx_b.recv_timeout(RECV).unwrap().watcher_id, b);
    assert!(manager.is_watching(b));
    assert!(manager.is_running());
    assert_eq!(manager.stats().stream_errors, 1);

    store.insert(&ns("db", "a"), json!({"_id": 1})).unwrap();
    assert!(rx_a.recv_timeout(QUIET).is_err());
}

#[test]
fn delivery_failure_keeps_watcher_active() {
    let (store, invoker, manager) = setup();
    let coll = ns("db", "coll");
    let id = manager.watch(coll.clone(), ChangeFilter::match_all(), "late").unwrap();

    // No sink registered yet: this event is dropped.
    store.insert(&coll, json!({"_id": 1})).unwrap();
    assert!(wait_until(|| manager.stats().delivery_failures == 1));
    assert!(manager.is_watching(id));

    let rx = subscribe(&invoker, "late");
    store.insert(&coll, json!({"_id": 2})).unwrap();
    assert_eq!(rx.recv_timeout(RECV).unwrap().event.document_key, json!({"_id": 2}));
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn unwatch_is_idempotent() {
    let (_store, _invoker, manager) = setup();
    let a = manager.watch(ns("db", "a"), ChangeFilter::match_all(), "cb").unwrap();
    let b = manager.watch(ns("db", "b"), ChangeFilter::match_all(), "cb").unwrap();

    manager.unwatch(a);
    manager.unwatch(a);
    assert_eq!(manager.active_watchers(), vec![b]);
    assert!(manager.is_running());

    manager.unwatch(b);
    manager.unwatch(b);
    assert!(!manager.is_running());
    assert_eq!(manager.stats().workers_started, 1);
}

#[test]
fn no_callback_fires_after_unwatch_returns() {
    let store = Arc::new(InMemoryChangeStore::new());
    let table = CallbackTable::new();
    let fired = Arc::new(AtomicU64::new(0));
    let f = Arc::clone(&fired);
    table.register("count", move |_| {
        f.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let manager = WatchManager::with_config(
        Arc::clone(&store) as Arc<dyn ChangeStreamSource>,
        Arc::new(table),
        config(),
    );
    let coll = ns("db", "hot");
    let id = manager.watch(coll.clone(), ChangeFilter::match_all(), "count").unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        let coll = coll.clone();
        thread::spawn(move || {
            let mut i = 0u64;
            while !stop.load(Ordering::SeqCst) {
                store.insert(&coll, json!({"_id": i})).unwrap();
                i += 1;
                thread::yield_now();
            }
        })
    };

    assert!(wait_until(|| fired.load(Ordering::SeqCst) > 10));
    manager.unwatch(id);
    let at_unwatch = fired.load(Ordering::SeqCst);
    thread::sleep(QUIET);
    assert_eq!(fired.load(Ordering::SeqCst), at_unwatch);

    stop.store(true, Ordering::SeqCst);
    producer.join().unwrap();
}

#[test]
fn interleaved_watch_unwatch_leaves_exactly_the_kept_ids() {
    let (_store, _invoker, manager) = setup();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut kept = Vec::new();
                for i in 0..40 {
                    let coll = format!("c{t}_{i}");
                    let id = manager.watch(ns("db", &coll), ChangeFilter::match_all(), "cb").unwrap();
                    if i % 3 == 0 {
                        kept.push(id);
                    } else {
                        manager.unwatch(id);
                    }
                }
                kept
            })
        })
        .collect();

    let kept: BTreeSet<WatcherId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let active: BTreeSet<WatcherId> = manager.active_watchers().into_iter().collect();
    assert_eq!(active, kept);
    assert_eq!(kept.len(), 8 * 14);
    assert!(manager.is_running());

    for id in kept {
        manager.unwatch(id);
    }
    assert!(!manager.is_running());
    assert!(manager.active_watchers().is_empty());
}

#[test]
fn queued_events_are_delivered_without_idle_sleeps() {
    let store = Arc::new(InMemoryChangeStore::new());
    let invoker = ChannelInvoker::new();
    let cfg = WatchConfig {
        idle_interval_ms: 1000,
        ..WatchConfig::default()
    };
    let manager = WatchManager::with_config(
        Arc::clone(&store) as Arc<dyn ChangeStreamSource>,
        Arc::new(invoker.clone()),
        cfg,
    );
    let rx = subscribe(&invoker, "burst");
    let coll = ns("db", "burst");
    manager.watch(coll.clone(), ChangeFilter::match_all(), "burst").unwrap();

    for i in 0..50 {
        store.insert(&coll, json!({"_id": i})).unwrap();
    }

    // The first event may wait out one idle sleep; the rest follow back to back.
    rx.recv_timeout(RECV).unwrap();
    let start = Instant::now();
    for _ in 1..50 {
        rx.recv_timeout(RECV).unwrap();
    }
    assert!(start.elapsed() < Duration::from_millis(500), "took {:?}", start.elapsed());
}

#[test]
fn blocking_cursor_does_not_stall_watch() {
    let store = Arc::new(InMemoryChangeStore::with_await_time(Duration::from_millis(300)));
    let manager = WatchManager::with_config(
        Arc::clone(&store) as Arc<dyn ChangeStreamSource>,
        Arc::new(ChannelInvoker::new()),
        config(),
    );
    manager.watch(ns("db", "idle"), ChangeFilter::match_all(), "cb").unwrap();
    // Let the worker enter a blocking read.
    thread::sleep(Duration::from_millis(20));

    for i in 0..5 {
        let start = Instant::now();
        manager.watch(ns("db", &format!("more{i}")), ChangeFilter::match_all(), "cb").unwrap();
        assert!(start.elapsed() < Duration::from_millis(150), "watch took {:?}", start.elapsed());
    }
    assert_eq!(manager.active_watchers().len(), 6);
}
