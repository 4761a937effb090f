//! # kyrowatch - change stream watch manager
//!
//! kyrowatch lets any number of independent consumers subscribe to live
//! change notifications from a document store and delivers every matching
//! event to a symbolic callback identity. All subscriptions are polled by a
//! single background worker that starts with the first watcher and stops
//! with the last.
//!
//! ## Core Concepts
//!
//! - **Watcher**: one subscription binding a collection and filter to a callback
//! - **WatchRegistry**: lock-guarded map of active watchers, iterated by snapshot
//! - **WatchManager**: owns the poll worker, the id counter and the registry
//! - **CallbackInvoker**: turns a callback identity plus an event into an invocation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kyrowatch::{CallbackTable, InMemoryChangeStore, WatchManager};
//!
//! let store = Arc::new(InMemoryChangeStore::new());
//! let callbacks = CallbackTable::new();
//! callbacks.register("on_triple", |d| {
//!     println!("{} changed: {:?}", d.event.ns, d.event.document_key);
//!     Ok(())
//! });
//!
//! let manager = WatchManager::new(store.clone(), Arc::new(callbacks));
//! let id = manager.watch_collection("kb", "triples", serde_json::json!({}), "on_triple")?;
//! // ...
//! manager.unwatch(id);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod store;
pub mod watch;

// Re-export primary types at crate root for convenience
pub use config::{RetryPolicy, WatchConfig};
pub use error::{DeliveryError, StreamError, StreamInitError, WatchError, WatchResult};
pub use event::{ChangeEvent, Namespace, OperationType};
pub use filter::{ChangeFilter, CompiledFilter};
pub use store::{ChangeCursor, ChangeStreamSource, InMemoryChangeStore, InMemoryCursor};
pub use watch::{
    CallbackId, CallbackInvoker, CallbackTable, ChannelInvoker, Delivery, Poll, WatchManager,
    WatchRegistry, WatchStats, Watcher, WatcherId, WatcherState,
};
