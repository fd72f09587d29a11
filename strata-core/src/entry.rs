//! Cache entries and their values.

use crate::{CacheKey, CacheKeyKind, ObjectInstance, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Load status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Init,
    Loading,
    Loaded,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Init => "init",
            Status::Loading => "loading",
            Status::Loaded => "loaded",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Stored value of a list or link collection: member object keys, not the
/// objects themselves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionData {
    pub data: Vec<CacheKey>,
    pub total_count: Option<String>,
}

/// Value stored at a cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Marks a deleted object.
    Tombstone,
    Object(Arc<ObjectInstance>),
    Collection(Arc<CollectionData>),
}

impl CacheValue {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, CacheValue::Tombstone)
    }

    pub fn as_object(&self) -> Option<&Arc<ObjectInstance>> {
        match self {
            CacheValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Arc<CollectionData>> {
        match self {
            CacheValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// Whether this value shape is legal for a key of `kind`.
    pub fn fits(&self, kind: CacheKeyKind) -> bool {
        match (self, kind) {
            (CacheValue::Tombstone, _) => true,
            (CacheValue::Object(_), CacheKeyKind::Object) => true,
            (CacheValue::Collection(_), CacheKeyKind::List | CacheKeyKind::SpecificLink) => true,
            _ => false,
        }
    }
}

/// One immutable write at a cache key. Replacing the entry is the only way
/// to change it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub cache_key: CacheKey,
    /// `None` until the first successful load.
    pub value: Option<CacheValue>,
    pub status: Status,
    pub last_updated: Timestamp,
}

impl Entry {
    pub fn new(cache_key: CacheKey, value: Option<CacheValue>, status: Status) -> Self {
        Self {
            cache_key,
            value,
            status,
            last_updated: chrono::Utc::now(),
        }
    }

    pub fn object(&self) -> Option<&Arc<ObjectInstance>> {
        self.value.as_ref().and_then(CacheValue::as_object)
    }

    pub fn collection(&self) -> Option<&Arc<CollectionData>> {
        self.value.as_ref().and_then(CacheValue::as_collection)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.as_ref().is_some_and(CacheValue::is_tombstone)
    }
}
