//! Canonicalization of query descriptors
//!
//! Two list queries that ask for the same thing must share a cache slot, so
//! their filter and sort descriptors are reduced to a canonical form before
//! they become part of a [`CacheKey`](crate::CacheKey). The canonical form is:
//!
//! - **Flat**: nested `$and`/`$or` are merged into their parent.
//! - **Minimal**: single-child combinators collapse to the child, empty ones
//!   become match-all, double negation is removed, duplicate children and
//!   duplicate `In` values are dropped.
//! - **Ordered**: children of commutative combinators are sorted by their
//!   canonical JSON, so insertion order never matters.
//!
//! Canonical values are interned per canonicalizer: equal inputs produce
//! [`Canonical`] handles that share one allocation.

use crate::{FilterExpr, FilterOperator, OrderBy, WhereClause};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

/// A value in canonical form. Only the canonicalizers construct these.
///
/// Equality and hashing use the canonical JSON fingerprint, so handles from
/// different canonicalizers still compare structurally.
pub struct Canonical<T> {
    value: Arc<T>,
    fingerprint: Arc<str>,
}

impl<T> Canonical<T> {
    /// Canonical JSON of the value.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// True when both handles share one interned allocation.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.value, &b.value)
    }
}

impl<T> Clone for Canonical<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fingerprint: Arc::clone(&self.fingerprint),
        }
    }
}

impl<T> Deref for Canonical<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> PartialEq for Canonical<T> {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl<T> Eq for Canonical<T> {}

impl<T> Hash for Canonical<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Canonical<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Canonical").field(&self.value).finish()
    }
}

impl<T: Serialize> Serialize for Canonical<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

fn fingerprint_of<T: Serialize + fmt::Debug>(value: &T) -> String {
    // serde_json maps are key-sorted, which makes this stable.
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}

/// Interning table for one descriptor type.
struct Interner<T> {
    by_fingerprint: HashMap<Arc<str>, Canonical<T>>,
}

impl<T: Serialize + fmt::Debug> Interner<T> {
    fn new() -> Self {
        Self {
            by_fingerprint: HashMap::new(),
        }
    }

    fn intern(&mut self, value: T) -> Canonical<T> {
        let fingerprint = fingerprint_of(&value);
        if let Some(existing) = self.by_fingerprint.get(fingerprint.as_str()) {
            return existing.clone();
        }
        let fingerprint: Arc<str> = Arc::from(fingerprint);
        let canonical = Canonical {
            value: Arc::new(value),
            fingerprint: Arc::clone(&fingerprint),
        };
        self.by_fingerprint.insert(fingerprint, canonical.clone());
        canonical
    }

    fn len(&self) -> usize {
        self.by_fingerprint.len()
    }
}

/// Canonicalizer for where clauses.
pub struct WhereClauseCanonicalizer {
    interned: Interner<WhereClause>,
}

impl Default for WhereClauseCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl WhereClauseCanonicalizer {
    pub fn new() -> Self {
        Self {
            interned: Interner::new(),
        }
    }

    pub fn canonicalize(&mut self, clause: &WhereClause) -> Canonical<WhereClause> {
        self.interned.intern(normalize(clause))
    }

    /// Number of distinct canonical clauses seen.
    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonicalizer for sort specifications. Order is significant, so this only
/// drops repeated fields (the first occurrence wins) and interns.
pub struct OrderByCanonicalizer {
    interned: Interner<OrderBy>,
}

impl Default for OrderByCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderByCanonicalizer {
    pub fn new() -> Self {
        Self {
            interned: Interner::new(),
        }
    }

    pub fn canonicalize(&mut self, order_by: &OrderBy) -> Canonical<OrderBy> {
        let mut seen = HashSet::new();
        let clauses = order_by
            .clauses()
            .iter()
            .filter(|c| seen.insert(c.field.clone()))
            .cloned()
            .collect();
        self.interned.intern(OrderBy(clauses))
    }
}

fn normalize(clause: &WhereClause) -> WhereClause {
    match clause {
        WhereClause::And(children) => combine(children, true),
        WhereClause::Or(children) => combine(children, false),
        WhereClause::Not(inner) => match normalize(inner) {
            WhereClause::Not(double) => *double,
            other => WhereClause::Not(Box::new(other)),
        },
        WhereClause::Filter(expr) => WhereClause::Filter(normalize_expr(expr)),
    }
}

fn combine(children: &[WhereClause], is_and: bool) -> WhereClause {
    let mut flat = Vec::with_capacity(children.len());
    for child in children {
        match normalize(child) {
            WhereClause::And(nested) if is_and => flat.extend(nested),
            WhereClause::Or(nested) if !is_and => flat.extend(nested),
            // A match-all disjunct makes the whole disjunction match-all.
            WhereClause::And(nested) if nested.is_empty() => return WhereClause::all(),
            other => flat.push(other),
        }
    }

    let mut keyed: Vec<(String, WhereClause)> =
        flat.into_iter().map(|c| (fingerprint_of(&c), c)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    let mut flat: Vec<WhereClause> = keyed.into_iter().map(|(_, c)| c).collect();

    match flat.len() {
        0 => WhereClause::all(),
        1 => flat.remove(0),
        _ if is_and => WhereClause::And(flat),
        _ => WhereClause::Or(flat),
    }
}

fn normalize_expr(expr: &FilterExpr) -> FilterExpr {
    let mut expr = expr.clone();
    if expr.operator == FilterOperator::In {
        if let Value::Array(values) = &mut expr.value {
            values.sort_by_cached_key(|v| v.to_string());
            values.dedup();
        }
    }
    expr
}
