//! Abstract change stream traits.
//!
//! These traits define the contract a store driver must implement so the
//! watch manager can open cursors and advance them from its poll worker.

use crate::error::{StreamError, StreamInitError};
use crate::event::{ChangeEvent, Namespace};
use crate::filter::ChangeFilter;

/// Opens change streams against a document store.
///
/// # Safety Considerations
/// - `open_change_stream` may be called concurrently from any caller thread
/// - Implementations must validate the filter here, not on first read
pub trait ChangeStreamSource: Send + Sync {
    /// Open a live cursor over changes to `ns` that match `filter`.
    fn open_change_stream(
        &self,
        ns: &Namespace,
        filter: &ChangeFilter,
    ) -> Result<Box<dyn ChangeCursor>, StreamInitError>;
}

/// A live change stream cursor.
///
/// Dropping the cursor releases it on the server side.
pub trait ChangeCursor: Send {
    /// Advance the cursor once.
    ///
    /// Returns `Ok(None)` when no change is currently available. May block for
    /// a bounded, store-defined interval while waiting for one. An `Err` is
    /// fatal: the cursor will not yield further events.
    fn try_next(&mut self) -> Result<Option<ChangeEvent>, StreamError>;
}
