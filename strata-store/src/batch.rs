//! Batch write context.

use crate::store::StoreState;
use std::collections::HashSet;
use std::sync::Arc;
use strata_core::{
    CacheKey, CacheValue, Changes, Entry, ObjectInstance, OptimisticId, PrimaryKey, Status,
};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Options for [`Store::batch`](crate::Store::batch).
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Write into a new optimistic layer with this id instead of truth.
    pub optimistic_id: Option<OptimisticId>,
}

impl BatchOptions {
    /// Write straight into the truth layer.
    pub fn truth() -> Self {
        Self::default()
    }

    /// Write into a fresh optimistic layer tagged `id`. The layer is only
    /// created if the batch actually writes, and is undone with
    /// [`Store::remove_layer`](crate::Store::remove_layer).
    pub fn optimistic(id: OptimisticId) -> Self {
        Self {
            optimistic_id: Some(id),
        }
    }
}

/// What a batch returned and what it changed.
#[derive(Debug)]
pub struct BatchOutcome<X> {
    pub ret_val: X,
    pub changes: Changes,
}

/// Handle given to a batch closure.
///
/// The target layer is decided once: truth when the batch has no optimistic
/// id, otherwise one optimistic layer created lazily on the first write.
/// Subscribers are notified when the context is flushed, once per written
/// key, and only if the entry visible at the top of the chain changed.
///
/// The closure runs with the store locked and must not call back into the
/// [`Store`](crate::Store).
pub struct BatchContext<'a> {
    state: &'a mut StoreState,
    changes: &'a mut Changes,
    optimistic_id: Option<OptimisticId>,
    needs_layer: bool,
    touched: Vec<(CacheKey, Option<Arc<Entry>>)>,
    touched_keys: HashSet<CacheKey>,
}

impl<'a> BatchContext<'a> {
    pub(crate) fn new(
        state: &'a mut StoreState,
        changes: &'a mut Changes,
        optimistic_id: Option<OptimisticId>,
    ) -> Self {
        let needs_layer = optimistic_id.is_some();
        Self {
            state,
            changes,
            optimistic_id,
            needs_layer,
            touched: Vec::new(),
            touched_keys: HashSet::new(),
        }
    }

    pub fn optimistic_id(&self) -> Option<&OptimisticId> {
        self.optimistic_id.as_ref()
    }

    /// Whether writes go to an optimistic layer.
    pub fn is_optimistic(&self) -> bool {
        self.optimistic_id.is_some()
    }

    pub fn changes(&mut self) -> &mut Changes {
        &mut *self.changes
    }

    /// Push the optimistic layer now if this batch needs one and has not
    /// created it yet.
    pub fn create_layer_if_needed(&mut self) {
        if !self.needs_layer {
            return;
        }
        if let Some(id) = &self.optimistic_id {
            self.state.top = self.state.top.add_layer(id.clone());
            debug!(layer_id = %id, depth = self.state.top.depth(), "Created optimistic layer");
        }
        self.needs_layer = false;
    }

    /// Read as this batch sees the cache: top of chain for optimistic
    /// batches, truth otherwise.
    pub fn read(&self, key: CacheKey) -> Option<Arc<Entry>> {
        if self.is_optimistic() {
            self.state.top.get(key)
        } else {
            self.state.truth.get(key)
        }
    }

    /// Unconditional write. Always produces a new entry.
    pub fn write(&mut self, key: CacheKey, value: Option<CacheValue>, status: Status) -> Arc<Entry> {
        debug_assert!(
            value.as_ref().map_or(true, |v| v.fits(key.kind())),
            "value shape does not match key kind {}",
            key.kind()
        );
        if self.touched_keys.insert(key) {
            let before = self.state.top.get(key);
            self.touched.push((key, before));
        }
        self.create_layer_if_needed();

        let entry = Arc::new(Entry::new(key, value, status));
        let layer = if self.is_optimistic() {
            &self.state.top
        } else {
            &self.state.truth
        };
        layer.set(key, Arc::clone(&entry));
        trace!(cache_key = %key, status = %status, optimistic = self.is_optimistic(), "Batch write");
        entry
    }

    /// Write unless value and status are deep-equal to what this batch
    /// reads. If only the status differs the existing value is kept.
    /// Returns whether a write happened.
    pub fn write_if_changed(
        &mut self,
        key: CacheKey,
        value: Option<CacheValue>,
        status: Status,
    ) -> bool {
        let value = match self.read(key) {
            Some(existing) if existing.value == value => {
                if existing.status == status {
                    debug!(cache_key = %key, status = %status, "Skipping no-op write");
                    return false;
                }
                existing.value.clone()
            }
            _ => value,
        };
        self.write(key, value, status);
        true
    }

    /// Change only the status, keeping whatever value is visible.
    pub fn set_status(&mut self, key: CacheKey, status: Status) -> bool {
        match self.read(key) {
            Some(existing) if existing.status == status => false,
            Some(existing) => {
                let value = existing.value.clone();
                self.write(key, value, status);
                true
            }
            None => {
                self.write(key, None, status);
                true
            }
        }
    }

    /// Tombstone `key`. No-op if it already is one.
    pub fn delete(&mut self, key: CacheKey, status: Status) -> bool {
        if self.read(key).is_some_and(|e| e.is_tombstone()) {
            return false;
        }
        self.write(key, Some(CacheValue::Tombstone), status);
        self.changes.register_deleted(key);
        true
    }

    /// Intern the cache key of an object.
    pub fn object_key(&mut self, object_type: &str, primary_key: &PrimaryKey) -> CacheKey {
        self.state.keys.object(object_type, primary_key)
    }

    /// Store an object at its own key and record it in `changes`.
    pub fn write_object(&mut self, object: impl Into<Arc<ObjectInstance>>, status: Status) -> CacheKey {
        let object = object.into();
        let key = self.object_key(&object.object_type, &object.primary_key);
        let is_new = self
            .read(key)
            .and_then(|e| e.value.clone())
            .map_or(true, |v| v.is_tombstone());
        if self.write_if_changed(key, Some(CacheValue::Object(Arc::clone(&object))), status) {
            self.changes.register_object(key, object, is_new);
        }
        key
    }

    pub fn delete_object(
        &mut self,
        object_type: &str,
        primary_key: &PrimaryKey,
        status: Status,
    ) -> CacheKey {
        let key = self.object_key(object_type, primary_key);
        self.delete(key, status);
        key
    }

    pub fn retain(&mut self, key: CacheKey) {
        self.state.ref_counts.retain(key);
    }

    pub fn release(&mut self, key: CacheKey) {
        self.state.ref_counts.release(key, Instant::now());
    }

    /// Notify subscribers of every key whose visible entry changed.
    pub(crate) fn flush(&mut self) {
        if self.touched.is_empty() {
            return;
        }
        let touched = std::mem::take(&mut self.touched);
        self.touched_keys.clear();
        let changed: Vec<CacheKey> = touched
            .into_iter()
            .filter(|(key, before)| !same_entry(before, &self.state.top.get(*key)))
            .map(|(key, _)| key)
            .collect();
        self.state.publish(&changed);
    }
}

impl Drop for BatchContext<'_> {
    fn drop(&mut self) {
        // Writes applied before a panic stay applied; still tell subscribers.
        self.flush();
    }
}

pub(crate) fn same_entry(a: &Option<Arc<Entry>>, b: &Option<Arc<Entry>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
