//! Change descriptor produced by every batch.

use crate::{CacheKey, ObjectInstance};
use std::collections::HashSet;
use std::sync::Arc;

/// What a batch changed. Queries inspect this after the batch to decide
/// whether to patch their own value or re-fetch.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    pub added: HashSet<CacheKey>,
    pub modified: HashSet<CacheKey>,
    pub deleted: HashSet<CacheKey>,
    pub added_objects: Vec<Arc<ObjectInstance>>,
    pub modified_objects: Vec<Arc<ObjectInstance>>,
    /// Query whose own fetch produced this batch, if any.
    pub origin: Option<CacheKey>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_origin(origin: CacheKey) -> Self {
        Self {
            origin: Some(origin),
            ..Self::default()
        }
    }

    pub fn register_object(&mut self, key: CacheKey, object: Arc<ObjectInstance>, is_new: bool) {
        if is_new {
            self.added.insert(key);
            self.added_objects.push(object);
        } else {
            self.modified.insert(key);
            self.modified_objects.push(object);
        }
    }

    pub fn register_list(&mut self, key: CacheKey) {
        self.modified.insert(key);
    }

    pub fn register_deleted(&mut self, key: CacheKey) {
        self.deleted.insert(key);
    }

    pub fn added_of_type<'a>(
        &'a self,
        object_type: &'a str,
    ) -> impl Iterator<Item = &'a Arc<ObjectInstance>> + 'a {
        self.added_objects
            .iter()
            .filter(move |o| o.object_type == object_type)
    }

    pub fn modified_of_type<'a>(
        &'a self,
        object_type: &'a str,
    ) -> impl Iterator<Item = &'a Arc<ObjectInstance>> + 'a {
        self.modified_objects
            .iter()
            .filter(move |o| o.object_type == object_type)
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}
