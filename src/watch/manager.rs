//! Watch manager and its poll worker.
//!
//! The manager owns one dedicated worker thread that round-robins over every
//! registered watcher. The worker is started when the first watcher is
//! registered and is stopped (signalled, then joined) when the last one is
//! removed. Thread count stays constant regardless of subscriber count; the
//! price is that a cycle's latency grows with the number of watchers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::error::{DeliveryError, StreamInitError, WatchError, WatchResult};
use crate::event::Namespace;
use crate::filter::ChangeFilter;
use crate::store::ChangeStreamSource;

use super::invoker::{CallbackId, CallbackInvoker, Delivery};
use super::registry::WatchRegistry;
use super::watcher::{Poll, Watcher, WatcherId};

/// Point-in-time counters for a manager.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WatchStats {
    pub delivered: u64,
    pub delivery_failures: u64,
    pub stream_errors: u64,
    pub workers_started: u64,
    pub active_watchers: usize,
    pub running: bool,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
    stream_errors: AtomicU64,
    workers_started: AtomicU64,
}

#[derive(Debug)]
struct WorkerHandle {
    join: JoinHandle<()>,
    stop_tx: Sender<()>,
}

#[derive(Debug)]
enum Lifecycle {
    Stopped,
    Running(WorkerHandle),
}

struct Shared {
    cfg: WatchConfig,
    registry: WatchRegistry,
    invoker: Arc<dyn CallbackInvoker>,
    running: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    worker_thread: Mutex<Option<ThreadId>>,
    counters: Counters,
}

impl Shared {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_thread(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.worker_thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_worker_thread(&self) -> bool {
        *self.worker_thread() == Some(thread::current().id())
    }

    /// Stop the worker from inside it once no watchers remain.
    ///
    /// Only succeeds if no `watch`/`unwatch` holds the lifecycle lock; those
    /// calls settle the worker's fate themselves.
    fn try_retire(&self) -> bool {
        let mut lifecycle = match self.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if !self.registry.is_empty() {
            return false;
        }
        self.running.store(false, Ordering::Release);
        // Detaches our own handle; the loop exits right after.
        *lifecycle = Lifecycle::Stopped;
        debug!("poll worker retiring: no active watchers");
        true
    }
}

/// Routes change stream events from any number of watchers to their
/// callbacks through a single poll worker.
pub struct WatchManager {
    source: Arc<dyn ChangeStreamSource>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("cfg", &self.shared.cfg)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl WatchManager {
    /// Create a manager with the default configuration.
    pub fn new(source: Arc<dyn ChangeStreamSource>, invoker: Arc<dyn CallbackInvoker>) -> Self {
        Self::with_config(source, invoker, WatchConfig::default())
    }

    /// Create a manager with an explicit configuration.
    pub fn with_config(
        source: Arc<dyn ChangeStreamSource>,
        invoker: Arc<dyn CallbackInvoker>,
        cfg: WatchConfig,
    ) -> Self {
        Self {
            source,
            shared: Arc::new(Shared {
                cfg: cfg.normalized(),
                registry: WatchRegistry::new(),
                invoker,
                running: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::Stopped),
                worker_thread: Mutex::new(None),
                counters: Counters::default(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `callback` to changes on `namespace` matching `filter`.
    ///
    /// Returns once the cursor is open and the watcher is registered. On
    /// failure nothing is registered, though the id counter has advanced.
    pub fn watch(
        &self,
        namespace: Namespace,
        filter: ChangeFilter,
        callback: impl Into<CallbackId>,
    ) -> WatchResult<WatcherId> {
        let callback = callback.into();
        let id = WatcherId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let watcher = Arc::new(self.open_watcher(id, &namespace, &filter, &callback)?);

        if self.shared.on_worker_thread() {
            // Called from a callback: the worker is alive by definition. If a
            // stop is pending, the joining caller restarts it for this entry.
            if !self.shared.registry.insert(Arc::clone(&watcher)) {
                watcher.close();
                return Err(WatchError::DuplicateWatcher { id });
            }
        } else {
            let mut lifecycle = self.shared.lock_lifecycle();
            if !self.shared.registry.insert(Arc::clone(&watcher)) {
                drop(lifecycle);
                watcher.close();
                return Err(WatchError::DuplicateWatcher { id });
            }
            if let Err(err) = ensure_worker(&self.shared, &mut lifecycle) {
                self.shared.registry.remove(id);
                drop(lifecycle);
                watcher.close();
                return Err(err);
            }
        }

        info!(watcher_id = %id, ns = %namespace, callback = %callback, "watcher registered");
        Ok(id)
    }

    /// `watch` taking raw database/collection names and a JSON filter.
    pub fn watch_collection(
        &self,
        db: &str,
        collection: &str,
        filter: serde_json::Value,
        callback: impl Into<CallbackId>,
    ) -> WatchResult<WatcherId> {
        let namespace = Namespace::new(db, collection)?;
        self.watch(namespace, ChangeFilter::new(filter), callback)
    }

    /// Remove a watcher and release its cursor. Unknown ids are ignored.
    ///
    /// When this removes the last watcher the worker is stopped and joined
    /// before returning. Once this returns no further callback fires for `id`.
    pub fn unwatch(&self, id: WatcherId) {
        if self.shared.on_worker_thread() {
            self.unwatch_from_worker(id);
            return;
        }

        let mut lifecycle = self.shared.lock_lifecycle();
        let Some(watcher) = self.shared.registry.remove(id) else {
            debug!(watcher_id = %id, "unwatch of unknown watcher ignored");
            return;
        };
        // Waits out a delivery in flight for this watcher.
        watcher.close();
        info!(watcher_id = %id, ns = %watcher.namespace(), "watcher removed");

        if self.shared.registry.is_empty() {
            stop_worker(&self.shared, &mut lifecycle);
            // A callback may have registered a watcher while we were joining.
            if !self.shared.registry.is_empty() {
                if let Err(err) = ensure_worker(&self.shared, &mut lifecycle) {
                    error!(error = %err, "failed to restart poll worker");
                }
            }
        }
    }

    /// The worker cannot join itself and may hold this watcher's cursor lock.
    fn unwatch_from_worker(&self, id: WatcherId) {
        let Some(watcher) = self.shared.registry.remove(id) else {
            debug!(watcher_id = %id, "unwatch of unknown watcher ignored");
            return;
        };
        watcher.try_close();
        info!(watcher_id = %id, ns = %watcher.namespace(), "watcher removed from callback");
    }

    /// Force-stop every watcher and the worker.
    pub fn shutdown(&self) {
        if self.shared.on_worker_thread() {
            for watcher in self.shared.registry.drain() {
                watcher.try_close();
            }
            return;
        }

        let mut lifecycle = self.shared.lock_lifecycle();
        let mut closed = close_all(self.shared.registry.drain());
        stop_worker(&self.shared, &mut lifecycle);
        // A callback in flight during the first drain may have registered
        // more watchers. With the worker joined and the lifecycle lock held,
        // nothing can add another.
        closed += close_all(self.shared.registry.drain());
        if closed > 0 {
            info!(watchers = closed, "watch manager shut down");
        }
    }

    /// Whether `id` is currently registered.
    #[must_use]
    pub fn is_watching(&self, id: WatcherId) -> bool {
        self.shared.registry.contains(id)
    }

    /// Ids of all active watchers in registration order.
    #[must_use]
    pub fn active_watchers(&self) -> Vec<WatcherId> {
        self.shared.registry.ids()
    }

    /// Whether the poll worker is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Snapshot of the delivery and lifecycle counters.
    #[must_use]
    pub fn stats(&self) -> WatchStats {
        let c = &self.shared.counters;
        WatchStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            stream_errors: c.stream_errors.load(Ordering::Relaxed),
            workers_started: c.workers_started.load(Ordering::Relaxed),
            active_watchers: self.shared.registry.len(),
            running: self.is_running(),
        }
    }

    /// The effective (normalized) configuration.
    #[must_use]
    pub fn config(&self) -> &WatchConfig {
        &self.shared.cfg
    }

    fn open_watcher(
        &self,
        id: WatcherId,
        namespace: &Namespace,
        filter: &ChangeFilter,
        callback: &CallbackId,
    ) -> Result<Watcher, StreamInitError> {
        let policy = &self.shared.cfg.open_retry;
        let mut attempt = 1;
        loop {
            match Watcher::open(id, self.source.as_ref(), namespace.clone(), filter.clone(), callback.clone()) {
                Ok(watcher) => return Ok(watcher),
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        watcher_id = %id,
                        ns = %namespace,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "change stream open failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    warn!(watcher_id = %id, ns = %namespace, error = %err, "change stream open failed");
                    return Err(err);
                }
            }
        }
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn close_all(watchers: Vec<Arc<Watcher>>) -> usize {
    for watcher in &watchers {
        watcher.close();
    }
    watchers.len()
}

/// Start the worker unless one is alive. Requires the lifecycle lock.
fn ensure_worker(shared: &Arc<Shared>, lifecycle: &mut Lifecycle) -> WatchResult<()> {
    if let Lifecycle::Running(handle) = lifecycle {
        if !handle.join.is_finished() {
            return Ok(());
        }
    }
    // Reap a worker that died without retiring.
    if let Lifecycle::Running(dead) = std::mem::replace(lifecycle, Lifecycle::Stopped) {
        if dead.join.join().is_err() {
            error!("poll worker terminated by panic");
        }
    }

    let (stop_tx, stop_rx) = bounded::<()>(1);
    shared.running.store(true, Ordering::Release);
    let thread_shared = Arc::clone(shared);
    let join = thread::Builder::new()
        .name(shared.cfg.worker_thread_name.clone())
        .spawn(move || worker_loop(&thread_shared, &stop_rx))
        .map_err(|e| {
            shared.running.store(false, Ordering::Release);
            WatchError::WorkerSpawn { message: e.to_string() }
        })?;

    shared.counters.workers_started.fetch_add(1, Ordering::Relaxed);
    debug!(thread = %shared.cfg.worker_thread_name, "poll worker started");
    *lifecycle = Lifecycle::Running(WorkerHandle { join, stop_tx });
    Ok(())
}

/// Signal the worker and join it. Requires the lifecycle lock.
fn stop_worker(shared: &Shared, lifecycle: &mut Lifecycle) {
    let Lifecycle::Running(handle) = std::mem::replace(lifecycle, Lifecycle::Stopped) else {
        return;
    };
    shared.running.store(false, Ordering::Release);
    let _ = handle.stop_tx.try_send(());
    if handle.join.join().is_err() {
        error!("poll worker terminated by panic");
    }
    debug!("poll worker stopped");
}

fn worker_loop(shared: &Shared, stop_rx: &Receiver<()>) {
    let me = thread::current().id();
    *shared.worker_thread() = Some(me);
    let idle = shared.cfg.idle_interval();

    while shared.running.load(Ordering::Acquire) {
        let snapshot = shared.registry.snapshot();
        if snapshot.is_empty() {
            if shared.try_retire() || !idle_wait(stop_rx, idle) {
                break;
            }
            continue;
        }

        let mut observed = false;
        for watcher in snapshot {
            observed |= poll_one(shared, &watcher);
        }
        if !observed && !idle_wait(stop_rx, idle) {
            break;
        }
    }

    let mut current = shared.worker_thread();
    if *current == Some(me) {
        *current = None;
    }
}

/// Returns false once the stop channel is gone.
fn idle_wait(stop_rx: &Receiver<()>, idle: Duration) -> bool {
    match stop_rx.recv_timeout(idle) {
        Ok(()) | Err(RecvTimeoutError::Timeout) => true,
        Err(RecvTimeoutError::Disconnected) => false,
    }
}

/// Poll one watcher; returns true if it produced an event.
fn poll_one(shared: &Shared, watcher: &Watcher) -> bool {
    let outcome = watcher.poll_with(|event| {
        let delivery = Delivery {
            watcher_id: watcher.id(),
            callback: watcher.callback().clone(),
            event: event.clone(),
        };
        panic::catch_unwind(AssertUnwindSafe(|| shared.invoker.deliver(&delivery))).unwrap_or_else(|_| {
            Err(DeliveryError::Rejected {
                callback: delivery.callback.to_string(),
                reason: "callback panicked".to_string(),
            })
        })
    });

    let observed = match outcome {
        Poll::NoEvent | Poll::Closed => false,
        Poll::Event(Ok(())) => {
            shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
            true
        }
        Poll::Event(Err(err)) => {
            shared.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                watcher_id = %watcher.id(),
                callback = %watcher.callback(),
                error = %err,
                "event delivery failed"
            );
            true
        }
        Poll::Error(err) => {
            shared.counters.stream_errors.fetch_add(1, Ordering::Relaxed);
            shared.registry.remove(watcher.id());
            warn!(
                watcher_id = %watcher.id(),
                ns = %watcher.namespace(),
                error = %err,
                "change stream failed, watcher removed"
            );
            false
        }
    };

    // Releases a cursor left behind by an unwatch issued from the callback.
    if !watcher.is_active() {
        watcher.close();
    }
    observed
}
