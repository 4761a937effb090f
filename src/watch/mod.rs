//! WATCH subsystem: change stream subscriptions.
//!
//! Any number of watchers share one poll worker owned by the `WatchManager`.
//! Each watcher binds a namespace and filter to a callback identity; matched
//! events leave through a `CallbackInvoker`.

/// Callback identities and delivery adapters.
pub mod invoker;
/// Manager and poll worker.
pub mod manager;
/// Registry of active watchers.
pub mod registry;
/// Single subscription state.
pub mod watcher;

pub use invoker::{CallbackFn, CallbackId, CallbackInvoker, CallbackTable, ChannelInvoker, Delivery};
pub use manager::{WatchManager, WatchStats};
pub use registry::WatchRegistry;
pub use watcher::{Poll, Watcher, WatcherId, WatcherState};
