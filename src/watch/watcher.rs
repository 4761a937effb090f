//! A single change stream subscription.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamInitError};
use crate::event::{ChangeEvent, Namespace};
use crate::filter::ChangeFilter;
use crate::store::{ChangeCursor, ChangeStreamSource};

use super::invoker::CallbackId;

/// Unique identifier for a watcher.
///
/// Issued by the manager from a monotonically increasing counter starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatcherId(u64);

impl WatcherId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a watcher. There is no transition back to `Active`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Active,
    Closed,
}

/// Outcome of one attempt to advance a watcher's cursor.
#[derive(Debug)]
pub enum Poll<T = ChangeEvent> {
    /// No change currently available.
    NoEvent,
    /// A matching change was read.
    Event(T),
    /// The cursor failed; the watcher is now closed.
    Error(StreamError),
    /// The watcher was already closed before this poll.
    Closed,
}

/// One subscription binding a namespace and filter to a callback identity.
///
/// The cursor sits behind a mutex that `poll_with` holds for the whole
/// read-and-handle step, so `close()` waits for an in-flight handler.
pub struct Watcher {
    id: WatcherId,
    namespace: Namespace,
    filter: ChangeFilter,
    callback: CallbackId,
    closed: AtomicBool,
    cursor: Mutex<Option<Box<dyn ChangeCursor>>>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("filter", &self.filter)
            .field("callback", &self.callback)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Open a live cursor for (`namespace`, `filter`).
    pub fn open(
        id: WatcherId,
        source: &dyn ChangeStreamSource,
        namespace: Namespace,
        filter: ChangeFilter,
        callback: CallbackId,
    ) -> Result<Self, StreamInitError> {
        let cursor = source.open_change_stream(&namespace, &filter)?;
        Ok(Self {
            id,
            namespace,
            filter,
            callback,
            closed: AtomicBool::new(false),
            cursor: Mutex::new(Some(cursor)),
        })
    }

    /// The id issued at registration.
    #[must_use]
    pub const fn id(&self) -> WatcherId {
        self.id
    }

    /// Watched namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Filter the cursor was opened with.
    #[must_use]
    pub const fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Callback identity events are delivered to.
    #[must_use]
    pub const fn callback(&self) -> &CallbackId {
        &self.callback
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WatcherState {
        if self.closed.load(Ordering::Acquire) {
            WatcherState::Closed
        } else {
            WatcherState::Active
        }
    }

    /// True until the watcher is closed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == WatcherState::Active
    }

    /// Advance the cursor once and return what it produced.
    pub fn poll(&self) -> Poll {
        self.poll_with(ChangeEvent::clone)
    }

    /// Advance the cursor once; on a change, run `on_event` before the
    /// watcher lock is released.
    pub fn poll_with<R>(&self, on_event: impl FnOnce(&ChangeEvent) -> R) -> Poll<R> {
        let mut guard = self.lock_cursor();
        if self.closed.load(Ordering::Acquire) {
            // A close requested from inside a handler leaves the cursor for us.
            guard.take();
            return Poll::Closed;
        }
        let Some(cursor) = guard.as_mut() else {
            return Poll::Closed;
        };

        match cursor.try_next() {
            Ok(None) => Poll::NoEvent,
            Ok(Some(event)) => Poll::Event(on_event(&event)),
            Err(err) => {
                self.closed.store(true, Ordering::Release);
                guard.take();
                Poll::Error(err)
            }
        }
    }

    /// Release the cursor. Idempotent; returns true if this call released it.
    pub fn close(&self) -> bool {
        self.closed.store(true, Ordering::Release);
        self.lock_cursor().take().is_some()
    }

    /// Close without blocking on the cursor lock.
    ///
    /// Used when the caller may already hold that lock (a handler running
    /// inside `poll_with`). If the lock is busy, the cursor is released by the
    /// next `poll_with` or `close` instead. Returns true if released here.
    pub(crate) fn try_close(&self) -> bool {
        self.closed.store(true, Ordering::Release);
        match self.cursor.try_lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take().is_some(),
            Err(TryLockError::WouldBlock) => false,
        }
    }

    fn lock_cursor(&self) -> MutexGuard<'_, Option<Box<dyn ChangeCursor>>> {
        // A panicking handler must not leak the cursor.
        self.cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
