//! STRATA Test Utilities
//!
//! Shared test infrastructure for the STRATA workspace:
//! - `MockOntology`, an in-memory fetcher with call counters, failure
//!   injection and a gate for holding fetches in flight
//! - Proptest generators for objects, where clauses and orderings
//! - Fixtures for the employee dataset used across the test suites
//! - Tracing setup for tests

pub use strata_core::{
    FetchError, ObjectInstance, OntologyFetcher, OrderBy, PageRequest, PageResult, PageSource,
    PrimaryKey, WhereClause,
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-writer subscriber once per process. Honors `RUST_LOG`,
/// defaulting to `strata=debug`.
pub fn init_test_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// MOCK FETCHER
// ============================================================================

type LinkKey = (String, PrimaryKey, String);

/// In-memory ontology.
///
/// Pages are served by filtering with loose where-clause evaluation,
/// sorting by the requested order, and slicing at an offset carried in the
/// page token.
pub struct MockOntology {
    objects: Mutex<BTreeMap<String, BTreeMap<PrimaryKey, ObjectInstance>>>,
    links: Mutex<HashMap<LinkKey, Vec<(String, PrimaryKey)>>>,
    failures: Mutex<VecDeque<FetchError>>,
    requests: Mutex<Vec<PageRequest>>,
    object_calls: AtomicUsize,
    page_calls: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl Default for MockOntology {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOntology {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            links: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            object_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
            gate,
        }
    }

    pub fn with_objects(objects: impl IntoIterator<Item = ObjectInstance>) -> Self {
        let mock = Self::new();
        for object in objects {
            mock.insert(object);
        }
        mock
    }

    /// Add or replace an object on the "server".
    pub fn insert(&self, object: ObjectInstance) {
        lock(&self.objects)
            .entry(object.object_type.clone())
            .or_default()
            .insert(object.primary_key.clone(), object);
    }

    pub fn remove(&self, object_type: &str, primary_key: &PrimaryKey) -> Option<ObjectInstance> {
        lock(&self.objects)
            .get_mut(object_type)
            .and_then(|objects| objects.remove(primary_key))
    }

    /// Link `source` to `target` under `link_name`.
    pub fn link(&self, source: &ObjectInstance, link_name: &str, target: &ObjectInstance) {
        lock(&self.links)
            .entry((
                source.object_type.clone(),
                source.primary_key.clone(),
                link_name.to_string(),
            ))
            .or_default()
            .push((target.object_type.clone(), target.primary_key.clone()));
    }

    /// Make the next fetch of either kind fail with `error`.
    pub fn fail_next(&self, error: FetchError) {
        lock(&self.failures).push_back(error);
    }

    /// Hold every fetch until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn object_calls(&self) -> usize {
        self.object_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.object_calls() + self.page_calls()
    }

    /// Every page request received so far.
    pub fn page_requests(&self) -> Vec<PageRequest> {
        lock(&self.requests).clone()
    }

    async fn pass_gate(&self) {
        let mut open = self.gate.subscribe();
        // The sender lives in `self`, so this only returns once open.
        open.wait_for(|open| *open).await.ok();
    }

    fn take_failure(&self) -> Option<FetchError> {
        lock(&self.failures).pop_front()
    }

    fn source_objects(&self, source: &PageSource) -> Vec<ObjectInstance> {
        let objects = lock(&self.objects);
        match source {
            PageSource::ObjectType(object_type) => objects
                .get(object_type)
                .map(|by_pk| by_pk.values().cloned().collect())
                .unwrap_or_default(),
            PageSource::Link {
                source_type,
                primary_key,
                link_name,
            } => {
                let links = lock(&self.links);
                let key = (source_type.clone(), primary_key.clone(), link_name.clone());
                links
                    .get(&key)
                    .map(|targets| {
                        targets
                            .iter()
                            .filter_map(|(t, pk)| objects.get(t).and_then(|m| m.get(pk)).cloned())
                            .collect()
                    })
                    .unwrap_or_default()
            }
        }
    }
}

#[async_trait]
impl OntologyFetcher for MockOntology {
    async fn fetch_object(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
    ) -> Result<ObjectInstance, FetchError> {
        self.object_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        lock(&self.objects)
            .get(object_type)
            .and_then(|objects| objects.get(primary_key))
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                object_type: object_type.to_string(),
                primary_key: primary_key.to_string(),
            })
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult, FetchError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        self.pass_gate().await;
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        let mut matching: Vec<ObjectInstance> = self
            .source_objects(&request.source)
            .into_iter()
            .filter(|o| request.where_clause.matches(o, false))
            .collect();
        matching.sort_by(|a, b| request.order_by.compare(a, b));

        let offset = match &request.page_token {
            Some(token) => token.parse::<usize>().map_err(|e| FetchError::Decode {
                reason: format!("bad page token {token:?}: {e}"),
            })?,
            None => 0,
        };
        let total = matching.len();
        let end = (offset + request.page_size as usize).min(total);
        let data = matching
            .into_iter()
            .skip(offset)
            .take(end.saturating_sub(offset))
            .collect();
        Ok(PageResult {
            data,
            next_page_token: (end < total).then(|| end.to_string()),
            total_count: Some(total.to_string()),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for STRATA data types.

    use super::*;
    use proptest::prelude::*;
    use strata_core::{FilterExpr, OrderByClause, SortDirection};

    pub const OFFICES: &[&str] = &["NYC", "SEA", "LON", "DEN"];
    pub const FIELDS: &[&str] = &["office", "age", "team", "name"];

    pub fn arb_primary_key() -> impl Strategy<Value = PrimaryKey> {
        prop_oneof![
            (0i64..10_000).prop_map(PrimaryKey::Integer),
            "[a-z]{1,8}".prop_map(PrimaryKey::String),
        ]
    }

    pub fn arb_office() -> impl Strategy<Value = &'static str> {
        prop::sample::select(OFFICES)
    }

    pub fn arb_field() -> impl Strategy<Value = &'static str> {
        prop::sample::select(FIELDS)
    }

    pub fn arb_employee() -> impl Strategy<Value = ObjectInstance> {
        (0i64..1_000, arb_office(), 18i64..70, "[a-z]{3,8}").prop_map(|(pk, office, age, name)| {
            ObjectInstance::new("Employee", pk)
                .with_property("office", office)
                .with_property("age", age)
                .with_property("name", name)
        })
    }

    /// A single comparison predicate.
    pub fn arb_filter() -> impl Strategy<Value = WhereClause> {
        prop_oneof![
            (arb_field(), arb_office()).prop_map(|(f, v)| WhereClause::eq(f, v)),
            (arb_field(), 0i64..100).prop_map(|(f, v)| FilterExpr::gt(f, v).into()),
            (arb_field(), 0i64..100).prop_map(|(f, v)| FilterExpr::lt(f, v).into()),
            (arb_field(), prop::collection::vec(arb_office(), 1..4))
                .prop_map(|(f, vs)| FilterExpr::one_of(f, vs).into()),
            (arb_field(), any::<bool>()).prop_map(|(f, b)| FilterExpr::is_null(f, b).into()),
        ]
    }

    /// Arbitrarily nested where clause.
    pub fn arb_where_clause() -> impl Strategy<Value = WhereClause> {
        arb_filter().prop_recursive(4, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(|clauses| WhereClause::and(clauses)),
                prop::collection::vec(inner.clone(), 0..4).prop_map(|clauses| WhereClause::or(clauses)),
                inner.prop_map(WhereClause::not),
            ]
        })
    }

    pub fn arb_order_by() -> impl Strategy<Value = OrderBy> {
        prop::collection::vec((arb_field(), any::<bool>()), 0..4).prop_map(|clauses| {
            OrderBy(
                clauses
                    .into_iter()
                    .map(|(field, asc)| OrderByClause {
                        field: field.to_string(),
                        direction: if asc {
                            SortDirection::Asc
                        } else {
                            SortDirection::Desc
                        },
                    })
                    .collect(),
            )
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built objects for common scenarios.

    use super::*;

    pub fn employee(pk: i64, office: &str) -> ObjectInstance {
        ObjectInstance::new("Employee", pk)
            .with_property("office", office)
            .with_property("name", format!("employee-{pk}"))
    }

    pub fn office(pk: &str, city: &str) -> ObjectInstance {
        ObjectInstance::new("Office", pk).with_property("city", city)
    }

    /// Employees 1..=count, alternating between NYC and SEA.
    pub fn employees(count: i64) -> Vec<ObjectInstance> {
        (1..=count)
            .map(|pk| employee(pk, if pk % 2 == 1 { "NYC" } else { "SEA" }))
            .collect()
    }

    /// An ontology holding `employees(count)`.
    pub fn employee_ontology(count: i64) -> MockOntology {
        MockOntology::with_objects(employees(count))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over resolved object lists.

    use super::*;
    use std::sync::Arc;

    /// Integer primary keys of `objects`, in order.
    pub fn primary_keys(objects: &[Arc<ObjectInstance>]) -> Vec<i64> {
        objects
            .iter()
            .filter_map(|o| match o.primary_key {
                PrimaryKey::Integer(pk) => Some(pk),
                PrimaryKey::String(_) => None,
            })
            .collect()
    }

    pub fn assert_primary_keys(objects: &[Arc<ObjectInstance>], expected: &[i64]) {
        assert_eq!(primary_keys(objects), expected, "unexpected member order");
    }

    pub fn assert_property(object: &ObjectInstance, name: &str, expected: impl Into<serde_json::Value>) {
        assert_eq!(
            object.property(name),
            Some(expected.into()),
            "property {name} of {}:{}",
            object.object_type,
            object.primary_key
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
