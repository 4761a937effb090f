//! Error types for kyrowatch.
//!
//! All errors are strongly typed using thiserror. Each stage of a watcher's
//! life has its own taxonomy: opening a stream, reading from it, and handing
//! a matched event to a callback.

use thiserror::Error;

use crate::watch::WatcherId;

/// Errors raised while opening a change stream.
///
/// These are surfaced synchronously to the `watch()` caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamInitError {
    #[error("Invalid namespace '{db}.{collection}': {reason}")]
    InvalidNamespace {
        db: String,
        collection: String,
        reason: String,
    },

    #[error("Invalid change filter: {reason}")]
    InvalidFilter {
        reason: String,
    },

    #[error("Document store unreachable: {message}")]
    Unreachable {
        message: String,
    },
}

impl StreamInitError {
    /// Returns true if a later attempt to open the same stream may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Errors raised by a previously healthy cursor.
///
/// A stream error is fatal for the affected watcher only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Cursor invalidated: {reason}")]
    CursorInvalidated {
        reason: String,
    },

    #[error("Change stream backend error: {message}")]
    Backend {
        message: String,
    },
}

/// Errors raised by a callback sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("No callback registered for '{callback}'")]
    UnknownCallback {
        callback: String,
    },

    #[error("Callback '{callback}' rejected event: {reason}")]
    Rejected {
        callback: String,
        reason: String,
    },

    #[error("Callback '{callback}' is disconnected")]
    Disconnected {
        callback: String,
    },
}

/// Top-level error type for the watch manager surface.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Stream init error: {0}")]
    Init(#[from] StreamInitError),

    #[error("Watcher {id} is already registered")]
    DuplicateWatcher {
        id: WatcherId,
    },

    #[error("Failed to spawn poll worker: {message}")]
    WorkerSpawn {
        message: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

impl WatchError {
    /// Returns true if this is a stream init error.
    #[must_use]
    pub const fn is_init(&self) -> bool {
        matches!(self, Self::Init(_))
    }

    /// Returns true if retrying the same `watch()` call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Init(e) => e.is_retryable(),
            Self::WorkerSpawn { .. } => true,
            Self::DuplicateWatcher { .. } | Self::InvalidConfig { .. } => false,
        }
    }
}

/// Result type alias for watch manager operations.
pub type WatchResult<T> = Result<T, WatchError>;
