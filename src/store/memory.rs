//! In-memory change stream backend.
//!
//! This module provides a thread-safe in-memory document store that emits
//! change events to open cursors. It is intended for embedded usage, tests,
//! and as a reference implementation of [`ChangeStreamSource`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde_json::Value;
use thiserror::Error;

use crate::error::{StreamError, StreamInitError};
use crate::event::{ChangeEvent, Namespace, OperationType};
use crate::filter::{ChangeFilter, CompiledFilter};
use crate::store::traits::{ChangeCursor, ChangeStreamSource};

/// Errors from write operations on the in-memory store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryStoreError {
    /// The value written is not a JSON object.
    #[error("Document must be an object")]
    NotADocument,

    /// The document has no `_id` field.
    #[error("Document is missing '_id'")]
    MissingId,

    /// A document with the same `_id` already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// No document with the given `_id` exists.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// A lock guarding store state was poisoned.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

fn lock_err(context: &'static str) -> MemoryStoreError {
    MemoryStoreError::BackendError(format!("poisoned lock: {context}"))
}

fn key_of(id: &Value) -> String {
    id.to_string()
}

#[derive(Debug)]
struct StreamSlot {
    tx: Sender<ChangeEvent>,
    filter: CompiledFilter,
    token: Weak<()>,
}

#[derive(Debug, Default)]
struct CollectionState {
    docs: BTreeMap<String, Value>,
    streams: Vec<StreamSlot>,
}

impl CollectionState {
    fn prune_streams(&mut self) {
        self.streams.retain(|slot| slot.token.strong_count() > 0);
    }

    fn is_idle(&self) -> bool {
        self.docs.is_empty() && self.streams.iter().all(|slot| slot.token.strong_count() == 0)
    }

    fn emit(&mut self, event: &ChangeEvent) {
        let doc = event.to_document();
        self.streams.retain(|slot| {
            if slot.token.strong_count() == 0 {
                return false;
            }
            if !slot.filter.matches(&doc) {
                return true;
            }
            slot.tx.send(event.clone()).is_ok()
        });
    }
}

#[derive(Debug)]
struct StoreState {
    reachable: bool,
    collections: HashMap<Namespace, CollectionState>,
}

/// Thread-safe in-memory document store with change streams.
#[derive(Debug)]
pub struct InMemoryChangeStore {
    state: RwLock<StoreState>,
    await_time: Duration,
}

impl Default for InMemoryChangeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeStore {
    /// Create an empty store whose cursors never block.
    #[must_use]
    pub fn new() -> Self {
        Self::with_await_time(Duration::ZERO)
    }

    /// Create an empty store whose cursors wait up to `await_time` per read.
    #[must_use]
    pub fn with_await_time(await_time: Duration) -> Self {
        Self {
            state: RwLock::new(StoreState {
                reachable: true,
                collections: HashMap::new(),
            }),
            await_time,
        }
    }

    /// Simulate the store going down (or coming back) for new streams.
    pub fn set_reachable(&self, reachable: bool) -> Result<(), MemoryStoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("store"))?;
        state.reachable = reachable;
        Ok(())
    }

    /// Insert a new document. Emits an `insert` event.
    pub fn insert(&self, ns: &Namespace, doc: Value) -> Result<(), MemoryStoreError> {
        let id = document_id(&doc)?;
        let key = key_of(&id);

        let mut state = self.state.write().map_err(|_| lock_err("store"))?;
        let coll = state.collections.entry(ns.clone()).or_default();
        if coll.docs.contains_key(&key) {
            return Err(MemoryStoreError::DuplicateKey(key));
        }
        coll.docs.insert(key, doc.clone());
        coll.emit(&ChangeEvent::new(
            OperationType::Insert,
            ns.clone(),
            serde_json::json!({ "_id": id }),
            Some(doc),
        ));
        Ok(())
    }

    /// Set top-level fields of an existing document. Emits an `update` event
    /// carrying the post-image.
    pub fn update(&self, ns: &Namespace, id: &Value, fields: Value) -> Result<(), MemoryStoreError> {
        let Value::Object(fields) = fields else {
            return Err(MemoryStoreError::NotADocument);
        };
        let key = key_of(id);

        let mut state = self.state.write().map_err(|_| lock_err("store"))?;
        let coll = state.collections.entry(ns.clone()).or_default();
        let Some(Value::Object(existing)) = coll.docs.get_mut(&key) else {
            return Err(MemoryStoreError::NotFound(key));
        };
        for (k, v) in fields {
            if k != "_id" {
                existing.insert(k, v);
            }
        }
        let post_image = Value::Object(existing.clone());
        coll.emit(&ChangeEvent::new(
            OperationType::Update,
            ns.clone(),
            serde_json::json!({ "_id": id }),
            Some(post_image),
        ));
        Ok(())
    }

    /// Replace an existing document wholesale. Emits a `replace` event.
    pub fn replace(&self, ns: &Namespace, doc: Value) -> Result<(), MemoryStoreError> {
        let id = document_id(&doc)?;
        let key = key_of(&id);

        let mut state = self.state.write().map_err(|_| lock_err("store"))?;
        let coll = state.collections.entry(ns.clone()).or_default();
        let Some(slot) = coll.docs.get_mut(&key) else {
            return Err(MemoryStoreError::NotFound(key));
        };
        *slot = doc.clone();
        coll.emit(&ChangeEvent::new(
            OperationType::Replace,
            ns.clone(),
            serde_json::json!({ "_id": id }),
            Some(doc),
        ));
        Ok(())
    }

    /// Delete a document by `_id`. Emits a `delete` event.
    pub fn delete(&self, ns: &Namespace, id: &Value) -> Result<(), MemoryStoreError> {
        let key = key_of(id);

        let mut state = self.state.write().map_err(|_| lock_err("store"))?;
        let coll = state.collections.entry(ns.clone()).or_default();
        if coll.docs.remove(&key).is_none() {
            return Err(MemoryStoreError::NotFound(key));
        }
        coll.emit(&ChangeEvent::new(
            OperationType::Delete,
            ns.clone(),
            serde_json::json!({ "_id": id }),
            None,
        ));
        Ok(())
    }

    /// Fetch a document by `_id`.
    pub fn get(&self, ns: &Namespace, id: &Value) -> Result<Option<Value>, MemoryStoreError> {
        let state = self.state.read().map_err(|_| lock_err("store"))?;
        Ok(state
            .collections
            .get(ns)
            .and_then(|coll| coll.docs.get(&key_of(id)))
            .cloned())
    }

    /// Fatally end every open cursor on `ns`.
    ///
    /// Events already queued are still yielded before the cursor fails.
    pub fn invalidate(&self, ns: &Namespace) -> Result<usize, MemoryStoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("store"))?;
        let Some(coll) = state.collections.get_mut(ns) else {
            return Ok(0);
        };
        let ended = coll.streams.iter().filter(|s| s.token.strong_count() > 0).count();
        coll.streams.clear();
        Ok(ended)
    }

    /// Number of cursors currently open on `ns`.
    pub fn open_streams(&self, ns: &Namespace) -> Result<usize, MemoryStoreError> {
        let state = self.state.read().map_err(|_| lock_err("store"))?;
        Ok(state
            .collections
            .get(ns)
            .map_or(0, |coll| coll.streams.iter().filter(|s| s.token.strong_count() > 0).count()))
    }
}

fn document_id(doc: &Value) -> Result<Value, MemoryStoreError> {
    let Value::Object(map) = doc else {
        return Err(MemoryStoreError::NotADocument);
    };
    map.get("_id").cloned().ok_or(MemoryStoreError::MissingId)
}

impl ChangeStreamSource for InMemoryChangeStore {
    fn open_change_stream(
        &self,
        ns: &Namespace,
        filter: &ChangeFilter,
    ) -> Result<Box<dyn ChangeCursor>, StreamInitError> {
        ns.validate()?;
        let compiled = filter.compile()?;

        let mut state = self.state.write().map_err(|_| StreamInitError::Unreachable {
            message: "poisoned lock: store".to_string(),
        })?;
        if !state.reachable {
            return Err(StreamInitError::Unreachable {
                message: format!("store is not accepting connections for {ns}"),
            });
        }

        // Dropped cursors leave slots behind until the next write; a quiet
        // namespace would otherwise accumulate them.
        state.collections.retain(|other, coll| other == ns || !coll.is_idle());
        let coll = state.collections.entry(ns.clone()).or_default();
        coll.prune_streams();

        let (tx, rx) = unbounded::<ChangeEvent>();
        let token = Arc::new(());
        coll.streams.push(StreamSlot {
            tx,
            filter: compiled,
            token: Arc::downgrade(&token),
        });

        Ok(Box::new(InMemoryCursor {
            ns: ns.clone(),
            rx,
            await_time: self.await_time,
            _token: token,
        }))
    }
}

/// Cursor over an [`InMemoryChangeStore`] change stream.
#[derive(Debug)]
pub struct InMemoryCursor {
    ns: Namespace,
    rx: Receiver<ChangeEvent>,
    await_time: Duration,
    _token: Arc<()>,
}

impl InMemoryCursor {
    fn invalidated(&self) -> StreamError {
        StreamError::CursorInvalidated {
            reason: format!("change stream on {} was invalidated", self.ns),
        }
    }
}

impl ChangeCursor for InMemoryCursor {
    fn try_next(&mut self) -> Result<Option<ChangeEvent>, StreamError> {
        if self.await_time.is_zero() {
            return match self.rx.try_recv() {
                Ok(event) => Ok(Some(event)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(self.invalidated()),
            };
        }

        match self.rx.recv_timeout(self.await_time) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.invalidated()),
        }
    }
}
