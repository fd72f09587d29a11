//! Store-level behaviour: object helpers, batches, optimistic layers,
//! invalidation and collection of idle keys.

mod support;

use async_trait::async_trait;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    CacheValue, FetchError, ObjectInstance, OntologyFetcher, OptimisticId, PageRequest,
    PageResult, PrimaryKey, QueryError, Status, StoreConfig, WhereClause,
};
use strata_store::{BatchOptions, ListOptions, ObserveOptions, Query, Store};
use strata_test_utils::assertions::assert_property;
use strata_test_utils::fixtures::{employee, employee_ontology};
use strata_test_utils::MockOntology;
use support::{next_matching, store_with};

fn opt(id: &str) -> OptimisticId {
    OptimisticId::new(id).expect("valid optimistic id")
}

fn drain<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> usize {
    let mut n = 0;
    while rx.try_recv().is_ok() {
        n += 1;
    }
    n
}

#[test]
fn test_update_then_get_object() {
    let (store, _) = store_with(MockOntology::new());
    let emp = employee(1, "NYC");
    store.update_object(emp.clone());
    let cached = store.get_object("Employee", 1).expect("cached");
    assert_eq!(*cached, emp);
}

#[test]
fn test_get_object_unknown_is_none() {
    let (store, _) = store_with(MockOntology::new());
    assert!(store.get_object("Employee", 404).is_none());
}

#[test]
fn test_delete_object_tombstones() {
    let (store, _) = store_with(MockOntology::new());
    let key = store.update_object(employee(1, "NYC"));
    store.delete_object("Employee", 1);
    assert!(store.get_object("Employee", 1).is_none());
    let entry = store.get_value(key).expect("entry kept");
    assert!(entry.is_tombstone());
}

#[test]
fn test_identical_write_does_not_notify() {
    let (store, _) = store_with(MockOntology::new());
    let key = store.update_object(employee(1, "NYC"));
    let mut rx = store.subscribe(key);
    assert_eq!(drain(&mut rx), 1);

    let outcome = store.batch(BatchOptions::truth(), |batch| {
        batch.write_object(employee(1, "NYC"), Status::Loaded)
    });
    assert!(outcome.changes.is_empty());
    assert_eq!(drain(&mut rx), 0);

    store.update_object(employee(1, "SEA"));
    assert_eq!(drain(&mut rx), 1);
}

#[test]
fn test_batch_notifies_once_per_key() {
    let (store, _) = store_with(MockOntology::new());
    let key = store.update_object(employee(1, "NYC"));
    let mut rx = store.subscribe(key);
    drain(&mut rx);

    store.batch(BatchOptions::truth(), |batch| {
        batch.write_object(employee(1, "SEA"), Status::Loaded);
        batch.write_object(employee(1, "LON"), Status::Loaded);
    });
    let payload = rx.try_recv().expect("one notification");
    assert!(rx.try_recv().is_err());
    let object = payload.entry.object().expect("object value");
    assert_property(object, "office", "LON");
}

#[test]
fn test_batch_returns_closure_value_and_changes() {
    let (store, _) = store_with(MockOntology::new());
    let outcome = store.batch(BatchOptions::truth(), |batch| {
        batch.write_object(employee(1, "NYC"), Status::Loaded);
        batch.write_object(employee(2, "SEA"), Status::Loaded);
        "done"
    });
    assert_eq!(outcome.ret_val, "done");
    assert_eq!(outcome.changes.added.len(), 2);
    assert!(outcome.changes.modified.is_empty());
}

#[test]
fn test_optimistic_write_then_remove_layer_restores_truth() {
    let (store, _) = store_with(MockOntology::new());
    let key = store.update_object(employee(1, "NYC"));
    let mut rx = store.subscribe(key);
    drain(&mut rx);

    store.batch(BatchOptions::optimistic(opt("opt1")), |batch| {
        batch.write(
            key,
            Some(CacheValue::Object(Arc::new(employee(1, "SEA")))),
            Status::Loaded,
        );
    });
    let optimistic = rx.try_recv().expect("optimistic write notifies");
    assert!(optimistic.is_optimistic);
    assert_eq!(store.top_layer().depth(), 2);

    store.remove_layer(&opt("opt1"));
    assert_eq!(drain(&mut rx), 1);
    assert!(store.top_layer().is_truth());
    let restored = store.get_object("Employee", 1).expect("truth value");
    assert_property(&restored, "office", "NYC");
}

#[test]
fn test_remove_layer_without_visible_change_is_silent() {
    let (store, _) = store_with(MockOntology::new());
    let key = store.update_object(employee(1, "NYC"));
    let mut rx = store.subscribe(key);
    drain(&mut rx);

    store.batch(BatchOptions::optimistic(opt("same")), |batch| {
        batch.write(
            key,
            Some(CacheValue::Object(Arc::new(employee(1, "NYC")))),
            Status::Loaded,
        );
    });
    drain(&mut rx);

    store.remove_layer(&opt("same"));
    assert_eq!(drain(&mut rx), 0);
}

#[test]
fn test_optimistic_batch_without_writes_creates_no_layer() {
    let (store, _) = store_with(MockOntology::new());
    store.update_object(employee(1, "NYC"));
    store.batch(BatchOptions::optimistic(opt("noop")), |batch| {
        batch.write_object(employee(1, "NYC"), Status::Loaded);
    });
    assert!(store.top_layer().is_truth());
}

#[test]
fn test_remove_middle_layer_keeps_layer_above() {
    let (store, _) = store_with(MockOntology::new());
    store.update_object(employee(1, "NYC"));
    store.update_object(employee(2, "NYC"));

    store.batch(BatchOptions::optimistic(opt("lower")), |batch| {
        batch.write_object(employee(1, "SEA"), Status::Loaded);
    });
    store.batch(BatchOptions::optimistic(opt("upper")), |batch| {
        batch.write_object(employee(2, "LON"), Status::Loaded);
    });
    assert_eq!(store.top_layer().depth(), 3);

    store.remove_layer(&opt("lower"));
    assert_eq!(store.top_layer().depth(), 2);
    assert_property(&store.get_object("Employee", 1).expect("emp 1"), "office", "NYC");
    assert_property(&store.get_object("Employee", 2).expect("emp 2"), "office", "LON");
}

#[test]
fn test_truth_write_under_optimistic_layer_is_shadowed() {
    let (store, _) = store_with(MockOntology::new());
    store.update_object(employee(1, "NYC"));
    store.batch(BatchOptions::optimistic(opt("pending")), |batch| {
        batch.write_object(employee(1, "SEA"), Status::Loaded);
    });

    store.update_object(employee(1, "LON"));
    assert_property(&store.get_object("Employee", 1).expect("emp"), "office", "SEA");

    store.remove_layer(&opt("pending"));
    assert_property(&store.get_object("Employee", 1).expect("emp"), "office", "LON");
}

#[test]
fn test_panicking_batch_still_notifies_and_store_stays_usable() {
    let (store, _) = store_with(MockOntology::new());
    let key = store.object_cache_key("Employee", &PrimaryKey::from(1));
    let mut rx = store.subscribe(key);
    drain(&mut rx);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        store.batch(BatchOptions::truth(), |batch| {
            batch.write_object(employee(1, "NYC"), Status::Loaded);
            panic!("caller bug inside batch");
        })
    }));
    assert!(result.is_err());

    let notified = rx.try_recv().expect("write notified during unwind");
    assert_eq!(notified.entry.status, Status::Loaded);
    assert_property(&store.get_object("Employee", 1).expect("written"), "office", "NYC");

    store.update_object(employee(1, "SEA"));
    assert_property(&store.get_object("Employee", 1).expect("rewritten"), "office", "SEA");
}

#[test]
fn test_list_queries_with_equivalent_where_are_identical() {
    let (store, _) = store_with(MockOntology::new());
    let nyc_senior = WhereClause::and([
        WhereClause::eq("office", "NYC"),
        WhereClause::eq("level", "senior"),
    ]);
    let reordered = WhereClause::and([
        WhereClause::eq("level", "senior"),
        WhereClause::and([WhereClause::eq("office", "NYC")]),
    ]);
    let a = store
        .get_list_query(&ListOptions::new("Employee").with_where(nyc_senior))
        .expect("valid list options");
    let b = store
        .get_list_query(&ListOptions::new("Employee").with_where(reordered))
        .expect("valid list options");
    assert!(Arc::ptr_eq(&a, &b));

    let other = store.get_list_query(&ListOptions::new("Office")).expect("valid list options");
    assert_ne!(a.cache_key(), other.cache_key());
}

#[test]
fn test_object_cache_key_is_interned() {
    let (store, _) = store_with(MockOntology::new());
    let a = store.object_cache_key("Employee", &PrimaryKey::from(1));
    let b = store.object_cache_key("Employee", &PrimaryKey::from(1));
    let c = store.object_cache_key("Employee", &PrimaryKey::from("1"));
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_with_config_validates() {
    let mock: Arc<MockOntology> = Arc::new(MockOntology::new());
    let bad = StoreConfig::default().with_gc_interval(Duration::ZERO);
    assert!(Store::with_config(mock.clone(), bad).is_err());
    assert!(Store::with_config(mock, StoreConfig::default()).is_ok());
}

#[tokio::test]
async fn test_invalidate_object_marks_loading_then_refetches() {
    let mock = employee_ontology(1);
    let (store, mock) = store_with(mock);
    store.update_object(employee(1, "NYC"));
    mock.insert(employee(1, "DEN"));
    mock.hold();

    let handle = store.invalidate_object("Employee", 1);
    let key = store.object_cache_key("Employee", &PrimaryKey::from(1));
    let entry = store.get_value(key).expect("entry");
    assert_eq!(entry.status, Status::Loading);
    assert_property(entry.object().expect("value kept"), "office", "NYC");

    mock.release();
    handle.await.expect("join").expect("revalidate");
    let entry = store.get_value(key).expect("entry");
    assert_eq!(entry.status, Status::Loaded);
    assert_property(entry.object().expect("fresh value"), "office", "DEN");
    assert_eq!(mock.object_calls(), 1);
}

#[tokio::test]
async fn test_invalidate_object_type_refetches_matching_queries() {
    let (store, mock) = store_with(employee_ontology(4));
    let object = store.get_object_query("Employee", 1);
    let list = store.get_list_query(&ListOptions::new("Employee")).expect("valid list options");
    let unrelated = store.get_list_query(&ListOptions::new("Office")).expect("valid list options");
    object.revalidate(true).await.expect("object");
    list.revalidate(true).await.expect("list");
    unrelated.revalidate(true).await.expect("offices");
    let (objects, pages) = (mock.object_calls(), mock.page_calls());

    store
        .invalidate_object_type("Employee")
        .await
        .expect("join")
        .expect("revalidate");
    assert_eq!(mock.object_calls(), objects + 1);
    assert_eq!(mock.page_calls(), pages + 1);
}

#[tokio::test]
async fn test_invalidate_all_refetches_everything() {
    let (store, mock) = store_with(employee_ontology(2));
    store.get_object_query("Employee", 1);
    store.get_object_query("Employee", 2);
    store.get_list_query(&ListOptions::new("Employee")).expect("valid list options");

    store
        .invalidate_all()
        .await
        .expect("join")
        .expect("revalidate");
    assert_eq!(mock.object_calls(), 2);
    assert_eq!(mock.page_calls(), 1);
}

/// Fetcher that panics on every request.
struct Panicking;

#[async_trait]
impl OntologyFetcher for Panicking {
    async fn fetch_object(
        &self,
        _object_type: &str,
        _primary_key: &PrimaryKey,
    ) -> Result<ObjectInstance, FetchError> {
        panic!("fetcher bug")
    }

    async fn fetch_page(&self, _request: &PageRequest) -> Result<PageResult, FetchError> {
        panic!("fetcher bug")
    }
}

#[tokio::test]
async fn test_invalidate_all_reports_panicked_revalidation() {
    let store = Store::new(Arc::new(Panicking));
    store.get_object_query("Employee", 1);

    let err = store
        .invalidate_all()
        .await
        .expect("outer task completes")
        .expect_err("panicked revalidation surfaces");
    assert!(matches!(err, QueryError::TaskFailed { .. }));
}

#[tokio::test]
async fn test_gc_collects_released_keys_and_closes_subjects() {
    let config = StoreConfig::default().with_key_retention(Duration::ZERO);
    let mock: Arc<MockOntology> = Arc::new(employee_ontology(1));
    let store = Store::with_config(mock, config).expect("config");

    let mut sub = store.observe_object("Employee", 1, ObserveOptions::default());
    let key = sub.cache_key();
    next_matching(&mut sub, |p| p.status == Status::Loaded).await;
    assert_eq!(store.ref_count(key), 1);
    assert_eq!(store.gc(), 0);

    let mut raw = store.subscribe(key);
    drain(&mut raw);
    sub.unsubscribe();
    assert_eq!(store.ref_count(key), 0);

    assert_eq!(store.gc(), 1);
    assert!(store.peek_query(key).is_none());
    assert!(raw.recv().await.is_none());
    assert!(store.get_object("Employee", 1).is_some());
}

#[tokio::test]
async fn test_gc_respects_retention() {
    let config = StoreConfig::default().with_key_retention(Duration::from_secs(3600));
    let mock: Arc<MockOntology> = Arc::new(MockOntology::new());
    let store = Store::with_config(mock, config).expect("config");
    let query = store.get_object_query("Employee", 1);
    assert_eq!(store.gc(), 0);
    assert!(store.peek_query(query.cache_key()).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_spawn_gc_runs_until_store_dropped() {
    let config = StoreConfig::default()
        .with_key_retention(Duration::from_millis(50))
        .with_gc_interval(Duration::from_millis(10));
    let mock: Arc<MockOntology> = Arc::new(MockOntology::new());
    let store = Store::with_config(mock, config).expect("config");
    let key = store.get_object_query("Employee", 1).cache_key();
    let gc = store.spawn_gc();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.peek_query(key).is_none());

    drop(store);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(gc.is_finished());
}
