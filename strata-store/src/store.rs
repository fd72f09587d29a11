//! The store: owner of the layer chain, key interner, query registry and
//! per-key subjects.
//!
//! All cache state sits behind one mutex. Writers take it for the length of
//! a batch or a layer removal; readers take it only long enough to walk the
//! layer chain. Subscriber notification happens inside the same critical
//! section as the write, but only as non-blocking channel sends, so no user
//! code ever runs with the store locked.

use crate::batch::{same_entry, BatchContext, BatchOptions, BatchOutcome};
use crate::layer::Layer;
use crate::lock::mutex_lock;
use crate::query::{
    resolve_page_size, CollectionCore, LinkOptions, ListOptions, ListQuery, ObjectQuery, ObserveMode, ObserveOptions,
    Query, QueryCore, RegisteredQuery, SpecificLinkQuery,
};
use crate::ref_counts::RefCounts;
use crate::subject::{Subject, SubjectPayload};
use crate::subscription::QuerySubscription;
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use strata_core::{
    CacheKey, CacheKeyKind, CacheKeys, Canonical, Changes, ConfigError, Entry,
    KeyPart, ObjectInstance, OntologyFetcher, OptimisticId, OrderBy, OrderByCanonicalizer,
    PageSource, PrimaryKey, QueryError, Status, StoreConfig, ValidationError, WhereClause,
    WhereClauseCanonicalizer,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// STATE
// ============================================================================

/// Everything guarded by the store mutex.
pub(crate) struct StoreState {
    pub(crate) keys: CacheKeys,
    where_canon: WhereClauseCanonicalizer,
    order_canon: OrderByCanonicalizer,
    pub(crate) truth: Arc<Layer>,
    pub(crate) top: Arc<Layer>,
    subjects: HashMap<CacheKey, Subject>,
    queries: HashMap<CacheKey, RegisteredQuery>,
    pub(crate) ref_counts: RefCounts,
}

impl StoreState {
    fn new(config: &StoreConfig) -> Self {
        let truth = Layer::truth();
        Self {
            keys: CacheKeys::new(),
            where_canon: WhereClauseCanonicalizer::new(),
            order_canon: OrderByCanonicalizer::new(),
            top: Arc::clone(&truth),
            truth,
            subjects: HashMap::new(),
            queries: HashMap::new(),
            ref_counts: RefCounts::new(config.key_retention()),
        }
    }

    /// Visible entry for `key`, or a never-loaded placeholder.
    fn visible_entry(&self, key: CacheKey) -> Arc<Entry> {
        self.top.get(key).unwrap_or_else(|| {
            Arc::new(Entry {
                cache_key: key,
                value: None,
                status: Status::Init,
                last_updated: DateTime::<Utc>::UNIX_EPOCH,
            })
        })
    }

    /// Whether the visible value at `key` differs from the truth value.
    fn is_optimistic(&self, key: CacheKey) -> bool {
        let top = self.top.get(key);
        if self.top.is_truth() {
            return false;
        }
        let truth = self.truth.get(key);
        if same_entry(&top, &truth) {
            return false;
        }
        top.and_then(|e| e.value.clone()) != truth.and_then(|e| e.value.clone())
    }

    pub(crate) fn payload_for(&self, key: CacheKey) -> SubjectPayload {
        let entry = self.visible_entry(key);
        let mut is_optimistic = self.is_optimistic(key);
        let members = entry.collection().map(|collection| {
            let mut resolved = Vec::with_capacity(collection.data.len());
            for member in &collection.data {
                let Some(object) = self.top.get(*member).and_then(|e| e.object().cloned()) else {
                    continue;
                };
                is_optimistic = is_optimistic || self.is_optimistic(*member);
                resolved.push(object);
            }
            Arc::new(resolved)
        });
        SubjectPayload {
            entry,
            is_optimistic,
            members,
        }
    }

    /// Emit on the subjects of `changed` keys, and of every observed
    /// collection whose visible member list includes one of them.
    pub(crate) fn publish(&mut self, changed: &[CacheKey]) {
        if changed.is_empty() || self.subjects.is_empty() {
            return;
        }
        let changed_set: HashSet<CacheKey> = changed.iter().copied().collect();
        let mut targets: Vec<CacheKey> = changed
            .iter()
            .copied()
            .filter(|k| self.subjects.contains_key(k))
            .collect();

        if changed.iter().any(|k| k.kind() == CacheKeyKind::Object) {
            for key in self.subjects.keys().filter(|k| k.is_collection()) {
                if changed_set.contains(key) {
                    continue;
                }
                let references_changed = self
                    .top
                    .get(*key)
                    .and_then(|e| e.collection().cloned())
                    .is_some_and(|c| c.data.iter().any(|m| changed_set.contains(m)));
                if references_changed {
                    targets.push(*key);
                }
            }
        }

        for key in targets {
            let payload = self.payload_for(key);
            if let Some(subject) = self.subjects.get_mut(&key) {
                subject.next(payload);
            }
        }
    }

    /// Attach a receiver to `key`'s subject, creating the subject on first
    /// use. The receiver is seeded with the current payload.
    fn subscribe(&mut self, key: CacheKey) -> UnboundedReceiver<SubjectPayload> {
        let mut subject = match self.subjects.remove(&key) {
            Some(subject) => subject,
            None => {
                self.ref_counts.register(key, Instant::now());
                Subject::new(self.payload_for(key))
            }
        };
        let receiver = subject.subscribe();
        self.subjects.insert(key, subject);
        receiver
    }

    pub(crate) fn release(&mut self, key: CacheKey) {
        self.ref_counts.release(key, Instant::now());
    }
}

// ============================================================================
// STORE
// ============================================================================

pub(crate) struct StoreInner {
    state: Mutex<StoreState>,
    fetcher: Arc<dyn OntologyFetcher>,
    config: StoreConfig,
}

/// Layered optimistic object cache.
///
/// Cheap to clone; clones share one cache. Operations that start fetches
/// (`observe_*`, `invalidate_*`, `spawn_gc`, and follow-up revalidation of
/// lists after a batch) spawn onto the ambient tokio runtime.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Store")
            .field("keys", &state.keys.len())
            .field("queries", &state.queries.len())
            .field("subjects", &state.subjects.len())
            .field("layers", &state.top.depth())
            .finish()
    }
}

impl Store {
    /// Empty store with default settings, fetching through `fetcher`.
    pub fn new(fetcher: Arc<dyn OntologyFetcher>) -> Self {
        Self::build(fetcher, StoreConfig::default())
    }

    /// Build a store with explicit settings. Fails if `config` is invalid.
    pub fn with_config(
        fetcher: Arc<dyn OntologyFetcher>,
        config: StoreConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(fetcher, config))
    }

    fn build(fetcher: Arc<dyn OntologyFetcher>, config: StoreConfig) -> Self {
        info!(
            key_retention_ms = config.key_retention_ms,
            default_page_size = config.default_page_size,
            "Store created"
        );
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::new(&config)),
                fetcher,
                config,
            }),
        }
    }

    pub(crate) fn from_weak(weak: &Weak<StoreInner>) -> Option<Store> {
        weak.upgrade().map(|inner| Store { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<StoreInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn fetcher(&self) -> &Arc<dyn OntologyFetcher> {
        &self.inner.fetcher
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        mutex_lock(&self.inner.state, "store", "state")
    }

    // ------------------------------------------------------------------------
    // Batches and layers
    // ------------------------------------------------------------------------

    /// Run `f` as one atomic write. See [`BatchContext`].
    ///
    /// After the batch, registered list and link queries inspect its
    /// changes and may patch themselves or schedule a re-fetch.
    pub fn batch<X>(
        &self,
        options: BatchOptions,
        f: impl FnOnce(&mut BatchContext<'_>) -> X,
    ) -> BatchOutcome<X> {
        let mut changes = Changes::new();
        let ret_val = self.batch_inner(options.optimistic_id.clone(), &mut changes, f);
        self.maybe_revalidate_queries(&mut changes, options.optimistic_id.as_ref());
        BatchOutcome { ret_val, changes }
    }

    /// Truth-layer batch issued by the query owning `origin`.
    pub(crate) fn batch_from<X>(
        &self,
        origin: CacheKey,
        f: impl FnOnce(&mut BatchContext<'_>) -> X,
    ) -> X {
        let mut changes = Changes::with_origin(origin);
        let ret_val = self.batch_inner(None, &mut changes, f);
        self.maybe_revalidate_queries(&mut changes, None);
        ret_val
    }

    /// Run `f` under the store lock, accumulating into `changes`. Does not
    /// run the follow-up query pass.
    pub(crate) fn batch_inner<X>(
        &self,
        optimistic_id: Option<OptimisticId>,
        changes: &mut Changes,
        f: impl FnOnce(&mut BatchContext<'_>) -> X,
    ) -> X {
        let mut state = self.lock();
        let mut batch = BatchContext::new(&mut state, changes, optimistic_id);
        let ret_val = f(&mut batch);
        batch.flush();
        ret_val
    }

    fn maybe_revalidate_queries(&self, changes: &mut Changes, optimistic_id: Option<&OptimisticId>) {
        if changes.is_empty() {
            return;
        }
        let queries: Vec<RegisteredQuery> = self.lock().queries.values().cloned().collect();
        let pending: Vec<(CacheKey, BoxFuture<'static, Result<(), QueryError>>)> = queries
            .iter()
            .filter_map(|q| {
                q.maybe_update_and_revalidate(self, changes, optimistic_id)
                    .map(|fut| (q.cache_key(), fut))
            })
            .collect();
        if pending.is_empty() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(count = pending.len(), "No tokio runtime, dropping follow-up revalidations");
            return;
        };
        for (key, fut) in pending {
            handle.spawn(async move {
                if let Err(err) = fut.await {
                    warn!(cache_key = %key, error = %err, "Follow-up revalidation failed");
                }
            });
        }
    }

    /// Drop every optimistic layer tagged `layer_id` and notify the keys
    /// whose visible entry changed as a result. Unknown ids are a no-op.
    pub fn remove_layer(&self, layer_id: &OptimisticId) {
        let mut state = self.lock();
        let layers = state.top.find_layers(layer_id);
        if layers.is_empty() {
            debug!(layer_id = %layer_id, "No layer to remove");
            return;
        }

        let keys: HashSet<CacheKey> = layers.iter().flat_map(|l| l.keys()).collect();
        let before: Vec<(CacheKey, Option<Arc<Entry>>)> =
            keys.into_iter().map(|k| (k, state.top.get(k))).collect();

        state.top = state.top.remove_layer(layer_id);

        let changed: Vec<CacheKey> = before
            .into_iter()
            .filter(|(key, prev)| !visibly_equal(prev, &state.top.get(*key)))
            .map(|(key, _)| key)
            .collect();
        debug!(
            layer_id = %layer_id,
            removed = layers.len(),
            changed = changed.len(),
            depth = state.top.depth(),
            "Removed optimistic layer"
        );
        state.publish(&changed);
    }

    pub fn top_layer(&self) -> Arc<Layer> {
        Arc::clone(&self.lock().top)
    }

    pub fn truth_layer(&self) -> Arc<Layer> {
        Arc::clone(&self.lock().truth)
    }

    // ------------------------------------------------------------------------
    // Reads and object helpers
    // ------------------------------------------------------------------------

    /// Visible entry at `key`.
    pub fn get_value(&self, key: CacheKey) -> Option<Arc<Entry>> {
        self.lock().top.get(key)
    }

    /// Visible object, if one is cached and not deleted.
    pub fn get_object(
        &self,
        object_type: &str,
        primary_key: impl Into<PrimaryKey>,
    ) -> Option<Arc<ObjectInstance>> {
        let state = self.lock();
        let key = state.keys.find_object(object_type, &primary_key.into())?;
        state.top.get(key).and_then(|e| e.object().cloned())
    }

    /// Write `object` to the truth layer with `loaded` status.
    pub fn update_object(&self, object: impl Into<Arc<ObjectInstance>>) -> CacheKey {
        self.batch(BatchOptions::truth(), |batch| {
            batch.write_object(object, Status::Loaded)
        })
        .ret_val
    }

    /// Tombstone an object in the truth layer.
    pub fn delete_object(&self, object_type: &str, primary_key: impl Into<PrimaryKey>) -> CacheKey {
        let primary_key = primary_key.into();
        self.batch(BatchOptions::truth(), |batch| {
            batch.delete_object(object_type, &primary_key, Status::Loaded)
        })
        .ret_val
    }

    pub fn object_cache_key(&self, object_type: &str, primary_key: &PrimaryKey) -> CacheKey {
        self.lock().keys.object(object_type, primary_key)
    }

    pub fn canonicalize_where(&self, where_clause: &WhereClause) -> Canonical<WhereClause> {
        self.lock().where_canon.canonicalize(where_clause)
    }

    pub fn canonicalize_order_by(&self, order_by: &OrderBy) -> Canonical<OrderBy> {
        self.lock().order_canon.canonicalize(order_by)
    }

    // ------------------------------------------------------------------------
    // Query registry
    // ------------------------------------------------------------------------

    /// Object query for `(object_type, primary_key)`, created on first use.
    pub fn get_object_query(
        &self,
        object_type: &str,
        primary_key: impl Into<PrimaryKey>,
    ) -> Arc<ObjectQuery> {
        let primary_key = primary_key.into();
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = state.keys.object(object_type, &primary_key);
        if let Some(RegisteredQuery::Object(query)) = state.queries.get(&key) {
            return Arc::clone(query);
        }

        let core = QueryCore::new(key, self.downgrade(), self.config().object_dedupe_interval());
        let query = Arc::new(ObjectQuery::new(core, object_type.to_string(), primary_key));
        state.queries.insert(key, RegisteredQuery::Object(Arc::clone(&query)));
        state.ref_counts.register(key, Instant::now());
        debug!(cache_key = %key, object_type, "Registered object query");
        query
    }

    /// List query for the canonical form of `options`, created on first use.
    /// Page size, auto-fetch and dedupe settings of later callers are
    /// ignored once the query exists.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidValue`] for a zero page size.
    pub fn get_list_query(&self, options: &ListOptions) -> Result<Arc<ListQuery>, ValidationError> {
        let page_size = resolve_page_size(options.page_size, self.config().default_page_size)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let where_clause = state.where_canon.canonicalize(&options.where_clause);
        let order_by = state.order_canon.canonicalize(&options.order_by);
        let key = state.keys.get(
            CacheKeyKind::List,
            &options.object_type,
            [
                KeyPart::Where(where_clause.clone()),
                KeyPart::OrderBy(order_by.clone()),
            ],
        );
        if let Some(RegisteredQuery::List(query)) = state.queries.get(&key) {
            return Ok(Arc::clone(query));
        }

        let config = self.config();
        let collection = CollectionCore::new(
            PageSource::ObjectType(options.object_type.clone()),
            Some(options.object_type.clone()),
            where_clause,
            order_by,
            page_size,
            options.auto_fetch_more,
        );
        let core = QueryCore::new(
            key,
            self.downgrade(),
            options
                .dedupe_interval
                .unwrap_or_else(|| config.list_dedupe_interval()),
        );
        let query = Arc::new(ListQuery::new(core, options.object_type.clone(), collection));
        state.queries.insert(key, RegisteredQuery::List(Arc::clone(&query)));
        state.ref_counts.register(key, Instant::now());
        debug!(cache_key = %key, object_type = %options.object_type, "Registered list query");
        Ok(query)
    }

    /// Link query for the canonical form of `options`, created on first use.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidValue`] for a zero page size.
    pub fn get_link_query(
        &self,
        options: &LinkOptions,
    ) -> Result<Arc<SpecificLinkQuery>, ValidationError> {
        let page_size = resolve_page_size(options.page_size, self.config().default_page_size)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let where_clause = state.where_canon.canonicalize(&options.where_clause);
        let order_by = state.order_canon.canonicalize(&options.order_by);
        let key = state.keys.get(
            CacheKeyKind::SpecificLink,
            &options.source_type,
            [
                KeyPart::PrimaryKey(options.primary_key.clone()),
                KeyPart::Text(options.link_name.clone()),
                KeyPart::Where(where_clause.clone()),
                KeyPart::OrderBy(order_by.clone()),
            ],
        );
        if let Some(RegisteredQuery::Link(query)) = state.queries.get(&key) {
            return Ok(Arc::clone(query));
        }

        let config = self.config();
        let collection = CollectionCore::new(
            PageSource::Link {
                source_type: options.source_type.clone(),
                primary_key: options.primary_key.clone(),
                link_name: options.link_name.clone(),
            },
            options.target_type.clone(),
            where_clause,
            order_by,
            page_size,
            options.auto_fetch_more,
        );
        let core = QueryCore::new(
            key,
            self.downgrade(),
            options
                .dedupe_interval
                .unwrap_or_else(|| config.list_dedupe_interval()),
        );
        let query = Arc::new(SpecificLinkQuery::new(core, options, collection));
        state.queries.insert(key, RegisteredQuery::Link(Arc::clone(&query)));
        state.ref_counts.register(key, Instant::now());
        debug!(
            cache_key = %key,
            source_type = %options.source_type,
            link = %options.link_name,
            "Registered link query"
        );
        Ok(query)
    }

    /// The registered query at `key`, if any.
    pub fn peek_query(&self, key: CacheKey) -> Option<RegisteredQuery> {
        self.lock().queries.get(&key).cloned()
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Subscribe to one object. The first payload is whatever is cached
    /// (`init` when nothing is); a revalidation follows unless `options`
    /// says offline.
    pub fn observe_object(
        &self,
        object_type: &str,
        primary_key: impl Into<PrimaryKey>,
        options: ObserveOptions,
    ) -> QuerySubscription<ObjectQuery> {
        let query = self.get_object_query(object_type, primary_key);
        self.observe(query, options)
    }

    /// Subscribe to the list described by `list`. Fails like
    /// [`get_list_query`](Self::get_list_query).
    pub fn observe_list(
        &self,
        list: &ListOptions,
        options: ObserveOptions,
    ) -> Result<QuerySubscription<ListQuery>, ValidationError> {
        let query = self.get_list_query(list)?;
        Ok(self.observe(query, options))
    }

    /// Subscribe to the objects behind one link of one source object. Fails
    /// like [`get_link_query`](Self::get_link_query).
    pub fn observe_links(
        &self,
        link: &LinkOptions,
        options: ObserveOptions,
    ) -> Result<QuerySubscription<SpecificLinkQuery>, ValidationError> {
        let query = self.get_link_query(link)?;
        Ok(self.observe(query, options))
    }

    /// Retain `query`, subscribe to its key and kick off a revalidation
    /// according to `options`.
    pub fn observe<Q: Query>(&self, query: Arc<Q>, options: ObserveOptions) -> QuerySubscription<Q> {
        let key = query.cache_key();
        let receiver = {
            let mut state = self.lock();
            state.ref_counts.retain(key);
            state.subscribe(key)
        };

        if options.mode != ObserveMode::Offline {
            let revalidation = query.revalidate(options.mode == ObserveMode::Force);
            tokio::spawn(async move {
                if let Err(err) = revalidation.await {
                    warn!(cache_key = %key, error = %err, "Revalidation after subscribe failed");
                }
            });
        }
        QuerySubscription::new(self.clone(), query, receiver)
    }

    /// Raw subscription to `key`, seeded with its current payload. Does not
    /// retain the key.
    pub fn subscribe(&self, key: CacheKey) -> UnboundedReceiver<SubjectPayload> {
        self.lock().subscribe(key)
    }

    // ------------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------------

    /// Mark the object `loading` (keeping its value) and force a re-fetch in
    /// the background.
    pub fn invalidate_object(
        &self,
        object_type: &str,
        primary_key: impl Into<PrimaryKey>,
    ) -> JoinHandle<Result<(), QueryError>> {
        let query = self.get_object_query(object_type, primary_key);
        let key = query.cache_key();
        self.batch(BatchOptions::truth(), |batch| {
            if batch.read(key).is_some() {
                batch.set_status(key, Status::Loading);
            }
        });
        let revalidation = query.revalidate(true);
        tokio::spawn(revalidation)
    }

    /// Force a re-fetch of every query concerning `object_type`: its object
    /// and list queries, and link queries from or to it.
    pub fn invalidate_object_type(&self, object_type: &str) -> JoinHandle<Result<(), QueryError>> {
        let queries: Vec<RegisteredQuery> = self
            .lock()
            .queries
            .values()
            .filter(|q| q.concerns_type(object_type))
            .cloned()
            .collect();
        debug!(object_type, count = queries.len(), "Invalidating object type");
        Self::revalidate_all(queries)
    }

    /// Force a re-fetch of every registered query.
    pub fn invalidate_all(&self) -> JoinHandle<Result<(), QueryError>> {
        let queries: Vec<RegisteredQuery> = self.lock().queries.values().cloned().collect();
        debug!(count = queries.len(), "Invalidating all queries");
        Self::revalidate_all(queries)
    }

    /// Each revalidation runs on its own task. A task that panics or is
    /// cancelled surfaces as [`QueryError::TaskFailed`].
    fn revalidate_all(queries: Vec<RegisteredQuery>) -> JoinHandle<Result<(), QueryError>> {
        let tasks: Vec<JoinHandle<Result<(), QueryError>>> = queries
            .iter()
            .map(|q| tokio::spawn(q.revalidate(true)))
            .collect();
        tokio::spawn(async move {
            for joined in join_all(tasks).await {
                joined.map_err(|err| QueryError::TaskFailed {
                    reason: err.to_string(),
                })??;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Reference counting and collection
    // ------------------------------------------------------------------------

    /// Take a hold on `key`, keeping its query and subject from collection.
    pub fn retain(&self, key: CacheKey) {
        self.lock().ref_counts.retain(key);
    }

    /// Drop a hold taken with [`retain`](Self::retain). At zero the key
    /// starts its retention period.
    pub fn release(&self, key: CacheKey) {
        self.lock().release(key);
    }

    /// Current number of holds on `key`.
    pub fn ref_count(&self, key: CacheKey) -> usize {
        self.lock().ref_counts.count(key)
    }

    /// Evict the query and subject of every key that has been unreferenced
    /// for the retention period. Entries stay cached. Returns how many keys
    /// were evicted.
    pub fn gc(&self) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let expired = state.ref_counts.take_expired(Instant::now());
        for key in &expired {
            if let Some(query) = state.queries.remove(key) {
                query.dispose(state);
            }
            state.subjects.remove(key);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "Collected idle keys");
        }
        expired.len()
    }

    /// Run [`gc`](Self::gc) on the configured interval until the store is
    /// dropped.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        let weak = self.downgrade();
        let period = self.config().gc_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(store) = Store::from_weak(&weak) else {
                    break;
                };
                store.gc();
            }
        })
    }
}

/// Same entry, or entries with equal value and status.
fn visibly_equal(a: &Option<Arc<Entry>>, b: &Option<Arc<Entry>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            Arc::ptr_eq(a, b) || (a.value == b.value && a.status == b.status)
        }
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{CacheValue, CollectionData, FetchError, PageRequest, PageResult};

    struct Offline;

    #[async_trait::async_trait]
    impl OntologyFetcher for Offline {
        async fn fetch_object(
            &self,
            object_type: &str,
            primary_key: &PrimaryKey,
        ) -> Result<ObjectInstance, FetchError> {
            Err(FetchError::NotFound {
                object_type: object_type.to_string(),
                primary_key: primary_key.to_string(),
            })
        }

        async fn fetch_page(&self, _request: &PageRequest) -> Result<PageResult, FetchError> {
            Ok(PageResult::default())
        }
    }

    fn store() -> Store {
        Store::new(Arc::new(Offline))
    }

    fn employee(pk: i64, office: &str) -> ObjectInstance {
        ObjectInstance::new("Employee", pk).with_property("office", office)
    }

    #[test]
    fn test_payload_for_unknown_key_is_init() {
        let store = store();
        let key = store.object_cache_key("Employee", &PrimaryKey::from(1));
        let payload = store.lock().payload_for(key);
        assert_eq!(payload.entry.status, Status::Init);
        assert!(payload.entry.value.is_none());
        assert!(!payload.is_optimistic);
    }

    #[test]
    fn test_optimistic_flag_tracks_deep_difference() {
        let store = store();
        let key = store.update_object(employee(1, "NYC"));
        let id = OptimisticId::new("same").expect("valid id");
        store.batch(BatchOptions::optimistic(id), |batch| {
            batch.write(
                key,
                Some(CacheValue::Object(Arc::new(employee(1, "NYC")))),
                Status::Loaded,
            );
        });
        assert!(!store.lock().payload_for(key).is_optimistic);

        let id = OptimisticId::new("moved").expect("valid id");
        store.batch(BatchOptions::optimistic(id), |batch| {
            batch.write_object(employee(1, "SEA"), Status::Loaded);
        });
        assert!(store.lock().payload_for(key).is_optimistic);
    }

    #[test]
    fn test_publish_reaches_collections_referencing_object() {
        let store = store();
        let member = store.update_object(employee(1, "NYC"));
        let list = store.lock().keys.get(CacheKeyKind::List, "Employee", Vec::<KeyPart>::new());
        store.batch(BatchOptions::truth(), |batch| {
            batch.write(
                list,
                Some(CacheValue::Collection(Arc::new(CollectionData {
                    data: vec![member],
                    total_count: None,
                }))),
                Status::Loaded,
            );
        });

        let mut rx = store.subscribe(list);
        assert!(rx.try_recv().is_ok());
        store.update_object(employee(1, "SEA"));
        let payload = rx.try_recv().expect("collection re-emitted");
        let members = payload.members.expect("resolved members");
        assert_eq!(
            members[0].property("office"),
            Some(serde_json::Value::from("SEA"))
        );
    }

    #[test]
    fn test_remove_unknown_layer_is_noop() {
        let store = store();
        let key = store.update_object(employee(1, "NYC"));
        let before = store.get_value(key);
        store.remove_layer(&OptimisticId::new("missing").expect("valid id"));
        assert!(same_entry(&before, &store.get_value(key)));
        assert!(store.top_layer().is_truth());
    }

    #[test]
    fn test_get_object_query_is_idempotent() {
        let store = store();
        let a = store.get_object_query("Employee", 1);
        let b = store.get_object_query("Employee", 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.ref_count(a.cache_key()), 0);
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let config = StoreConfig::default().with_default_page_size(0);
        assert!(Store::with_config(Arc::new(Offline), config).is_err());
    }

    #[test]
    fn test_gc_evicts_idle_queries_but_keeps_entries() {
        let config = StoreConfig::default().with_key_retention(std::time::Duration::ZERO);
        let store = Store::with_config(Arc::new(Offline), config).expect("valid config");
        let key = store.update_object(employee(1, "NYC"));
        let query = store.get_object_query("Employee", 1);
        assert_eq!(query.cache_key(), key);

        assert_eq!(store.gc(), 1);
        assert!(store.peek_query(key).is_none());
        assert!(store.get_object("Employee", 1).is_some());
    }
}
