//! Change event types.
//!
//! A `ChangeEvent` is one entry of a collection's change stream. Field names
//! serialize in the camelCase layout document stores use for change events,
//! so filters can address them by path (e.g. `operationType`,
//! `fullDocument.status`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StreamInitError;

/// Maximum combined length of `"<db>.<collection>"`.
pub const MAX_NAMESPACE_LEN: usize = 255;

/// Characters a database name may not contain.
const DB_FORBIDDEN: &[char] = &['/', '\\', '.', ' ', '"', '$', '\0'];

/// A database/collection pair identifying the watched collection.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    #[serde(rename = "coll")]
    pub collection: String,
}

impl Namespace {
    /// Build a validated namespace.
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Result<Self, StreamInitError> {
        let ns = Self {
            db: db.into(),
            collection: collection.into(),
        };
        ns.validate()?;
        Ok(ns)
    }

    /// Check naming rules for both halves of the namespace.
    pub fn validate(&self) -> Result<(), StreamInitError> {
        let invalid = |reason: &str| StreamInitError::InvalidNamespace {
            db: self.db.clone(),
            collection: self.collection.clone(),
            reason: reason.to_string(),
        };

        if self.db.is_empty() {
            return Err(invalid("database name cannot be empty"));
        }
        if self.db.contains(DB_FORBIDDEN) {
            return Err(invalid("database name contains a forbidden character"));
        }
        if self.collection.is_empty() {
            return Err(invalid("collection name cannot be empty"));
        }
        if self.collection.contains(['$', '\0']) {
            return Err(invalid("collection name contains a forbidden character"));
        }
        if self.collection.starts_with("system.") {
            return Err(invalid("system collections cannot be watched"));
        }
        if self.db.len() + 1 + self.collection.len() > MAX_NAMESPACE_LEN {
            return Err(invalid("namespace exceeds maximum length"));
        }
        Ok(())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Kind of modification recorded by a change event.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

impl OperationType {
    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

/// One entry of a change stream.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Opaque token identifying this event's position in the stream.
    #[serde(rename = "_id")]
    pub resume_token: Uuid,
    pub operation_type: OperationType,
    pub ns: Namespace,
    pub document_key: serde_json::Value,
    /// Post-image of the document; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<serde_json::Value>,
    pub cluster_time: DateTime<Utc>,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(
        operation_type: OperationType,
        ns: Namespace,
        document_key: serde_json::Value,
        full_document: Option<serde_json::Value>,
    ) -> Self {
        Self {
            resume_token: Uuid::new_v4(),
            operation_type,
            ns,
            document_key,
            full_document,
            cluster_time: Utc::now(),
        }
    }

    /// The event rendered as a JSON document, the shape filters match against.
    #[must_use]
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
