//! Layer chain
//!
//! The cache is a singly linked chain of layers. The base ("truth") layer
//! holds server-confirmed state; each optimistic layer above it holds the
//! speculative writes of one operation. Reads walk from the top toward the
//! base and return the first entry found, so later layers shadow earlier
//! ones.
//!
//! Writes only ever touch the local map of one layer. Removing a layer
//! never mutates an existing `Layer`: the layers above the removed one are
//! copied onto the surviving parent, so anyone still holding the old top
//! keeps a consistent view.

use crate::lock::{rw_read, rw_write};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use strata_core::{CacheKey, Entry, OptimisticId};

pub struct Layer {
    layer_id: Option<OptimisticId>,
    parent: Option<Arc<Layer>>,
    entries: RwLock<HashMap<CacheKey, Arc<Entry>>>,
}

impl Layer {
    /// A fresh truth layer.
    pub fn truth() -> Arc<Layer> {
        Arc::new(Layer {
            layer_id: None,
            parent: None,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn layer_id(&self) -> Option<&OptimisticId> {
        self.layer_id.as_ref()
    }

    pub fn parent(&self) -> Option<&Arc<Layer>> {
        self.parent.as_ref()
    }

    pub fn is_truth(&self) -> bool {
        self.parent.is_none()
    }

    /// First entry for `key` walking toward the base.
    pub fn get(&self, key: CacheKey) -> Option<Arc<Entry>> {
        let mut layer = Some(self);
        while let Some(current) = layer {
            if let Some(entry) = current.get_local(key) {
                return Some(entry);
            }
            layer = current.parent.as_deref();
        }
        None
    }

    pub fn get_local(&self, key: CacheKey) -> Option<Arc<Entry>> {
        rw_read(&self.entries, "layer", "get").get(&key).cloned()
    }

    pub fn set(&self, key: CacheKey, entry: Arc<Entry>) {
        rw_write(&self.entries, "layer", "set").insert(key, entry);
    }

    /// New optimistic layer on top of this one.
    pub fn add_layer(self: &Arc<Self>, layer_id: OptimisticId) -> Arc<Layer> {
        Arc::new(Layer {
            layer_id: Some(layer_id),
            parent: Some(Arc::clone(self)),
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Chain with every layer carrying `layer_id` spliced out.
    ///
    /// Layers below the last removed one are shared with the old chain;
    /// layers above it are copied. A missing id returns `self`.
    pub fn remove_layer(self: &Arc<Self>, layer_id: &OptimisticId) -> Arc<Layer> {
        let Some(parent) = &self.parent else {
            return Arc::clone(self);
        };

        let new_parent = parent.remove_layer(layer_id);
        if self.layer_id.as_ref() == Some(layer_id) {
            return new_parent;
        }
        if Arc::ptr_eq(&new_parent, parent) {
            return Arc::clone(self);
        }

        let entries = rw_read(&self.entries, "layer", "remove_layer").clone();
        Arc::new(Layer {
            layer_id: self.layer_id.clone(),
            parent: Some(new_parent),
            entries: RwLock::new(entries),
        })
    }

    /// Local entries only.
    pub fn entries(&self) -> Vec<(CacheKey, Arc<Entry>)> {
        rw_read(&self.entries, "layer", "entries")
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        rw_read(&self.entries, "layer", "keys").keys().copied().collect()
    }

    /// Every layer in the chain (self included) carrying `layer_id`.
    pub fn find_layers(self: &Arc<Self>, layer_id: &OptimisticId) -> Vec<Arc<Layer>> {
        let mut found = Vec::new();
        let mut layer = Some(self);
        while let Some(current) = layer {
            if current.layer_id.as_ref() == Some(layer_id) {
                found.push(Arc::clone(current));
            }
            layer = current.parent.as_ref();
        }
        found
    }

    /// Number of layers from here to the base, inclusive.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut layer = self.parent.as_deref();
        while let Some(current) = layer {
            depth += 1;
            layer = current.parent.as_deref();
        }
        depth
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("layer_id", &self.layer_id)
            .field("entries", &rw_read(&self.entries, "layer", "debug").len())
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strata_core::{CacheKeys, Status};

    fn id(s: &str) -> OptimisticId {
        OptimisticId::new(s).unwrap()
    }

    fn entry(key: CacheKey) -> Arc<Entry> {
        Arc::new(Entry::new(key, None, Status::Loaded))
    }

    #[test]
    fn test_get_walks_toward_base() {
        let mut keys = CacheKeys::new();
        let k = keys.object("Employee", &1.into());
        let base = Layer::truth();
        let e0 = entry(k);
        base.set(k, Arc::clone(&e0));

        let l1 = base.add_layer(id("opt1"));
        assert!(Arc::ptr_eq(&l1.get(k).unwrap(), &e0));
        assert!(l1.get_local(k).is_none());

        let e1 = entry(k);
        l1.set(k, Arc::clone(&e1));
        assert!(Arc::ptr_eq(&l1.get(k).unwrap(), &e1));
        assert!(Arc::ptr_eq(&base.get(k).unwrap(), &e0));
    }

    #[test]
    fn test_remove_middle_layer_keeps_others() {
        let mut keys = CacheKeys::new();
        let a = keys.object("Employee", &1.into());
        let b = keys.object("Employee", &2.into());
        let base = Layer::truth();
        let l1 = base.add_layer(id("opt1"));
        l1.set(a, entry(a));
        let l2 = l1.add_layer(id("opt2"));
        let eb = entry(b);
        l2.set(b, Arc::clone(&eb));

        let top = l2.remove_layer(&id("opt1"));
        assert_eq!(top.depth(), 2);
        assert_eq!(top.layer_id(), Some(&id("opt2")));
        assert!(top.get(a).is_none());
        assert!(Arc::ptr_eq(&top.get(b).unwrap(), &eb));
        // old chain untouched
        assert!(l2.get(a).is_some());
        assert_eq!(l2.depth(), 3);
    }

    #[test]
    fn test_remove_missing_layer_is_noop() {
        let base = Layer::truth();
        let l1 = base.add_layer(id("opt1"));
        let top = l1.remove_layer(&id("nope"));
        assert!(Arc::ptr_eq(&top, &l1));
        assert!(Arc::ptr_eq(&base.remove_layer(&id("opt1")), &base));
    }

    #[test]
    fn test_remove_all_layers_with_same_id() {
        let base = Layer::truth();
        let top = base
            .add_layer(id("opt1"))
            .add_layer(id("opt2"))
            .add_layer(id("opt1"));
        assert_eq!(top.find_layers(&id("opt1")).len(), 2);
        let top = top.remove_layer(&id("opt1"));
        assert_eq!(top.depth(), 2);
        assert_eq!(top.layer_id(), Some(&id("opt2")));
    }

    /// Per-layer writes: which of three keys each of three layers sets.
    fn arb_writes() -> impl Strategy<Value = [[bool; 3]; 3]> {
        prop::array::uniform3(prop::array::uniform3(any::<bool>()))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_top_shadows_lower_layers(writes in arb_writes()) {
            let mut keys = CacheKeys::new();
            let ks: Vec<CacheKey> = (0..3).map(|i| keys.object("T", &(i as i64).into())).collect();
            let base = Layer::truth();
            let l1 = base.add_layer(id("l1"));
            let l2 = l1.add_layer(id("l2"));
            let layers = [&base, &l1, &l2];
            for (layer, row) in layers.iter().zip(writes.iter()) {
                for (k, set) in ks.iter().zip(row.iter()) {
                    if *set {
                        layer.set(*k, entry(*k));
                    }
                }
            }
            for k in &ks {
                let expected = l2.get_local(*k)
                    .or_else(|| l1.get_local(*k))
                    .or_else(|| base.get_local(*k));
                let actual = l2.get(*k);
                prop_assert_eq!(expected.is_some(), actual.is_some());
                if let (Some(e), Some(a)) = (expected, actual) {
                    prop_assert!(Arc::ptr_eq(&e, &a));
                }
            }
        }

        #[test]
        fn prop_removal_preserves_non_target_layers(writes in arb_writes()) {
            let mut keys = CacheKeys::new();
            let ks: Vec<CacheKey> = (0..3).map(|i| keys.object("T", &(i as i64).into())).collect();
            let base = Layer::truth();
            let l1 = base.add_layer(id("l1"));
            let l2 = l1.add_layer(id("l2"));
            for (layer, row) in [&base, &l1, &l2].iter().zip(writes.iter()) {
                for (k, set) in ks.iter().zip(row.iter()) {
                    if *set {
                        layer.set(*k, entry(*k));
                    }
                }
            }
            let top = l2.remove_layer(&id("l1"));
            let mut expected_local = l2.keys();
            let mut actual_local = top.keys();
            expected_local.sort();
            actual_local.sort();
            prop_assert_eq!(expected_local, actual_local);
            prop_assert!(Arc::ptr_eq(top.parent().unwrap(), &base));
            for k in &ks {
                let expected = l2.get_local(*k).or_else(|| base.get_local(*k));
                let actual = top.get(*k);
                prop_assert_eq!(expected.map(|e| Arc::as_ptr(&e)), actual.map(|e| Arc::as_ptr(&e)));
            }
        }
    }
}
