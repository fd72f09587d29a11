//! Cache key interning
//!
//! A [`CacheKey`] is a small `Copy` handle into a per-store arena. The
//! interner maps the structural description of a cacheable unit
//! (`kind`, type name, identifying parts) to exactly one handle, so two
//! lookups for the same thing always yield the same key and the key can be
//! used directly for map lookups and subscription routing.

use crate::{Canonical, OrderBy, PrimaryKey, WhereClause};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Kind of cacheable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheKeyKind {
    Object,
    List,
    SpecificLink,
}

impl CacheKeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKeyKind::Object => "object",
            CacheKeyKind::List => "list",
            CacheKeyKind::SpecificLink => "specificLink",
        }
    }
}

impl fmt::Display for CacheKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One identifying value inside a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum KeyPart {
    Text(String),
    PrimaryKey(PrimaryKey),
    Where(Canonical<WhereClause>),
    OrderBy(Canonical<OrderBy>),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Text(value.to_string())
    }
}

impl From<PrimaryKey> for KeyPart {
    fn from(value: PrimaryKey) -> Self {
        KeyPart::PrimaryKey(value)
    }
}

impl From<Canonical<WhereClause>> for KeyPart {
    fn from(value: Canonical<WhereClause>) -> Self {
        KeyPart::Where(value)
    }
}

impl From<Canonical<OrderBy>> for KeyPart {
    fn from(value: Canonical<OrderBy>) -> Self {
        KeyPart::OrderBy(value)
    }
}

/// Structural description of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKeyData {
    pub kind: CacheKeyKind,
    pub type_name: String,
    pub parts: Vec<KeyPart>,
}

impl CacheKeyData {
    /// The primary key part of an object key.
    pub fn primary_key(&self) -> Option<&PrimaryKey> {
        match (self.kind, self.parts.first()) {
            (CacheKeyKind::Object, Some(KeyPart::PrimaryKey(pk))) => Some(pk),
            _ => None,
        }
    }
}

/// Interned cache key handle.
///
/// Ids come from a per-store counter and are never reused, so equality of
/// handles is equality of the structures they were interned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    id: u64,
    kind: CacheKeyKind,
}

impl CacheKey {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> CacheKeyKind {
        self.kind
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, CacheKeyKind::List | CacheKeyKind::SpecificLink)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Arena interner for cache keys. Grows monotonically for the life of the
/// store that owns it.
#[derive(Default)]
pub struct CacheKeys {
    next_id: u64,
    by_structure: HashMap<Arc<CacheKeyData>, CacheKey>,
    by_key: HashMap<CacheKey, Arc<CacheKeyData>>,
}

impl CacheKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `(kind, type_name, parts)`.
    pub fn get(
        &mut self,
        kind: CacheKeyKind,
        type_name: &str,
        parts: impl IntoIterator<Item = KeyPart>,
    ) -> CacheKey {
        let data = CacheKeyData {
            kind,
            type_name: type_name.to_string(),
            parts: parts.into_iter().collect(),
        };
        if let Some(key) = self.by_structure.get(&data) {
            return *key;
        }

        self.next_id += 1;
        let key = CacheKey {
            id: self.next_id,
            kind,
        };
        let data = Arc::new(data);
        self.by_structure.insert(Arc::clone(&data), key);
        self.by_key.insert(key, data);
        key
    }

    pub fn object(&mut self, object_type: &str, primary_key: &PrimaryKey) -> CacheKey {
        self.get(
            CacheKeyKind::Object,
            object_type,
            [KeyPart::PrimaryKey(primary_key.clone())],
        )
    }

    /// Look up an already interned object key without creating one.
    pub fn find_object(&self, object_type: &str, primary_key: &PrimaryKey) -> Option<CacheKey> {
        let data = CacheKeyData {
            kind: CacheKeyKind::Object,
            type_name: object_type.to_string(),
            parts: vec![KeyPart::PrimaryKey(primary_key.clone())],
        };
        self.by_structure.get(&data).copied()
    }

    /// Structural description of an interned key.
    pub fn describe(&self, key: CacheKey) -> Option<&CacheKeyData> {
        self.by_key.get(&key).map(|d| d.as_ref())
    }

    pub fn type_name(&self, key: CacheKey) -> Option<&str> {
        self.describe(key).map(|d| d.type_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WhereClauseCanonicalizer;
    use proptest::prelude::*;

    #[test]
    fn test_object_keys_are_interned() {
        let mut keys = CacheKeys::new();
        let a = keys.object("Employee", &PrimaryKey::from(1));
        let b = keys.object("Employee", &PrimaryKey::from(1));
        let c = keys.object("Employee", &PrimaryKey::from(2));
        let d = keys.object("Office", &PrimaryKey::from(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys.describe(a).unwrap().primary_key(), Some(&PrimaryKey::from(1)));
    }

    #[test]
    fn test_kind_participates_in_identity() {
        let mut keys = CacheKeys::new();
        let a = keys.get(CacheKeyKind::List, "Employee", [KeyPart::from("x")]);
        let b = keys.get(CacheKeyKind::SpecificLink, "Employee", [KeyPart::from("x")]);
        assert_ne!(a, b);
        assert!(a.is_collection());
    }

    #[test]
    fn test_canonical_where_parts_intern_together() {
        let mut keys = CacheKeys::new();
        let mut canon = WhereClauseCanonicalizer::new();
        let w1 = canon.canonicalize(&WhereClause::and([
            WhereClause::eq("office", "NYC"),
            WhereClause::eq("team", "core"),
        ]));
        let w2 = canon.canonicalize(&WhereClause::and([
            WhereClause::eq("team", "core"),
            WhereClause::eq("office", "NYC"),
        ]));
        let a = keys.get(CacheKeyKind::List, "Employee", [KeyPart::Where(w1)]);
        let b = keys.get(CacheKeyKind::List, "Employee", [KeyPart::Where(w2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_find_object_does_not_intern() {
        let mut keys = CacheKeys::new();
        assert!(keys.find_object("Employee", &PrimaryKey::from(1)).is_none());
        let key = keys.object("Employee", &PrimaryKey::from(1));
        assert_eq!(keys.find_object("Employee", &PrimaryKey::from(1)), Some(key));
    }

    fn arb_tuple() -> impl Strategy<Value = (CacheKeyKind, String, Vec<String>)> {
        (
            prop_oneof![
                Just(CacheKeyKind::Object),
                Just(CacheKeyKind::List),
                Just(CacheKeyKind::SpecificLink),
            ],
            "[A-C]",
            prop::collection::vec("[a-c]{1,2}", 0..3),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]

        #[test]
        fn prop_interning_is_structural(a in arb_tuple(), b in arb_tuple()) {
            let mut keys = CacheKeys::new();
            let parts = |p: &Vec<String>| p.iter().map(|s| KeyPart::Text(s.clone())).collect::<Vec<_>>();
            let ka = keys.get(a.0, &a.1, parts(&a.2));
            let kb = keys.get(b.0, &b.1, parts(&b.2));
            let ka_again = keys.get(a.0, &a.1, parts(&a.2));
            prop_assert_eq!(ka, ka_again);
            prop_assert_eq!(ka == kb, a == b);
        }
    }
}
