//! Change stream sources.
//!
//! The traits here are the seam between the watch manager and a document
//! store driver. An in-memory backend is provided for embedded use and tests.

pub mod memory;
mod traits;

pub use memory::{InMemoryChangeStore, InMemoryCursor, MemoryStoreError};
pub use traits::{ChangeCursor, ChangeStreamSource};
