//! Callback delivery.
//!
//! A watcher only stores a symbolic `CallbackId`. Turning that identity into
//! an actual invocation is the job of a [`CallbackInvoker`], supplied by the
//! embedding application.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::event::ChangeEvent;

use super::watcher::WatcherId;

/// Opaque symbolic reference to a subscriber's callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(String);

impl CallbackId {
    /// Wrap a callback identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallbackId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A matched change bound for one callback.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub watcher_id: WatcherId,
    pub callback: CallbackId,
    pub event: ChangeEvent,
}

/// Delivers matched events to subscribers.
///
/// Called from the poll worker thread. A failure is reported by the manager
/// and never retried.
pub trait CallbackInvoker: Send + Sync {
    /// Invoke the callback named by `delivery.callback`.
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError>;
}

/// Boxed callback handler.
pub type CallbackFn = Arc<dyn Fn(&Delivery) -> Result<(), String> + Send + Sync>;

// Routing maps only hold plain values; a panic cannot leave one half-written.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves callback identities to registered closures.
#[derive(Default, Clone)]
pub struct CallbackTable {
    handlers: Arc<RwLock<HashMap<CallbackId, CallbackFn>>>,
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<CallbackId> = read_lock(&self.handlers).keys().cloned().collect();
        f.debug_struct("CallbackTable").field("callbacks", &names).finish()
    }
}

impl CallbackTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `id`.
    pub fn register<F>(&self, id: impl Into<CallbackId>, handler: F)
    where
        F: Fn(&Delivery) -> Result<(), String> + Send + Sync + 'static,
    {
        write_lock(&self.handlers).insert(id.into(), Arc::new(handler));
    }

    /// Remove the handler for `id`.
    pub fn unregister(&self, id: &CallbackId) -> bool {
        write_lock(&self.handlers).remove(id).is_some()
    }
}

impl CallbackInvoker for CallbackTable {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        // Clone the handler out so it runs without the table lock.
        let handler = read_lock(&self.handlers)
            .get(&delivery.callback)
            .cloned()
            .ok_or_else(|| DeliveryError::UnknownCallback {
                callback: delivery.callback.to_string(),
            })?;

        handler(delivery).map_err(|reason| DeliveryError::Rejected {
            callback: delivery.callback.to_string(),
            reason,
        })
    }
}

/// Resolves callback identities to channel senders.
///
/// Never blocks the poll worker: a full channel rejects the event.
#[derive(Debug, Default, Clone)]
pub struct ChannelInvoker {
    senders: Arc<RwLock<HashMap<CallbackId, Sender<Delivery>>>>,
}

impl ChannelInvoker {
    /// Create an invoker with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route deliveries for `id` into `tx`.
    pub fn register(&self, id: impl Into<CallbackId>, tx: Sender<Delivery>) {
        write_lock(&self.senders).insert(id.into(), tx);
    }
}

impl CallbackInvoker for ChannelInvoker {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let callback = delivery.callback.to_string();
        let guard = read_lock(&self.senders);
        let Some(tx) = guard.get(&delivery.callback) else {
            return Err(DeliveryError::UnknownCallback { callback });
        };

        match tx.try_send(delivery.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Rejected {
                callback,
                reason: "channel is full".to_string(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(DeliveryError::Disconnected { callback }),
        }
    }
}
