//! Live queries
//!
//! A query is the stateful owner of one cache key: it knows how to fetch the
//! key's data, writes the result into the store, and hands out
//! subscriptions. The store keeps at most one query per key.
//!
//! # Revalidation
//!
//! At most one fetch per query is in flight. A non-forced `revalidate`
//! joins the in-flight fetch if there is one, and is skipped entirely when
//! the last fetch started within the dedupe interval. A forced `revalidate`
//! always starts a new fetch. Concurrent fetches are not sequenced: whichever
//! batch is applied last wins.
//!
//! # Failures
//!
//! A [`FetchError`](strata_core::FetchError) from the collaborator is logged
//! and recorded as `error` status with the previous value kept; the
//! revalidation still resolves `Ok`. Any [`QueryError`] is also recorded as
//! `error` status, and is then returned to every caller awaiting the fetch.

mod collection;
mod link;
mod list;
mod object;

pub use collection::{AutoFetchMore, CollectionCore, CollectionQuery, ListPayload};
pub(crate) use collection::resolve_page_size;
pub use link::{LinkOptions, SpecificLinkQuery};
pub use list::{ListOptions, ListQuery};
pub use object::{ObjectPayload, ObjectQuery};

use crate::batch::BatchContext;
use crate::lock::mutex_lock;
use crate::store::{Store, StoreInner, StoreState};
use crate::subject::SubjectPayload;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use strata_core::{CacheKey, Changes, OptimisticId, QueryError, Status};
use tokio::time::Instant;
use tracing::{debug, error};

pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<(), QueryError>>>;

struct PendingFetch {
    generation: u64,
    future: SharedFetch,
}

#[derive(Default)]
pub(crate) struct FetchState {
    pending: Option<PendingFetch>,
    generation: u64,
    last_started: Option<Instant>,
}

/// State shared by every query variant.
pub struct QueryCore {
    cache_key: CacheKey,
    store: Weak<StoreInner>,
    dedupe_interval: Duration,
    fetch: Arc<Mutex<FetchState>>,
}

impl QueryCore {
    pub(crate) fn new(cache_key: CacheKey, store: Weak<StoreInner>, dedupe_interval: Duration) -> Self {
        Self {
            cache_key,
            store,
            dedupe_interval,
            fetch: Arc::new(Mutex::new(FetchState::default())),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        self.cache_key
    }

    pub fn is_fetching(&self) -> bool {
        self.lock_fetch().pending.is_some()
    }

    pub(crate) fn store(&self) -> Result<Store, QueryError> {
        Store::from_weak(&self.store).ok_or(QueryError::StoreDropped)
    }

    pub(crate) fn lock_fetch(&self) -> MutexGuard<'_, FetchState> {
        mutex_lock(&self.fetch, "query", "fetch_state")
    }

    pub(crate) fn pending(state: &FetchState) -> Option<SharedFetch> {
        state.pending.as_ref().map(|p| p.future.clone())
    }

    /// Install `fetch` as the in-flight fetch, replacing any previous one.
    ///
    /// The installed future records unexpected errors as `error` status and
    /// clears the pending slot when it completes, unless a newer fetch has
    /// taken the slot in the meantime.
    pub(crate) fn start_locked(
        &self,
        state: &mut FetchState,
        fetch: BoxFuture<'static, Result<(), QueryError>>,
    ) -> SharedFetch {
        state.generation += 1;
        let generation = state.generation;
        let slot = Arc::clone(&self.fetch);
        let store = self.store.clone();
        let key = self.cache_key;

        let future = async move {
            let result = fetch.await;
            if let Err(err) = &result {
                error!(cache_key = %key, error = %err, "Unexpected error while fetching");
                if let Some(store) = Store::from_weak(&store) {
                    store.batch_from(key, |batch| {
                        batch.set_status(key, Status::Error);
                    });
                }
            }
            let mut state = mutex_lock(&slot, "query", "fetch_complete");
            if state
                .pending
                .as_ref()
                .is_some_and(|p| p.generation == generation)
            {
                state.pending = None;
            }
            result
        }
        .boxed()
        .shared();

        state.pending = Some(PendingFetch {
            generation,
            future: future.clone(),
        });
        state.last_started = Some(Instant::now());
        future
    }
}

/// Common protocol of the query variants.
pub trait Query: Send + Sync + 'static {
    /// What subscribers receive.
    type Payload: Clone + Send + 'static;

    fn core(&self) -> &QueryCore;

    /// Typed view of a raw subject notification.
    fn to_payload(&self, raw: &SubjectPayload) -> Self::Payload;

    /// One full fetch-and-write cycle.
    fn fetch_and_store(self: Arc<Self>) -> BoxFuture<'static, Result<(), QueryError>>;

    fn cache_key(&self) -> CacheKey {
        self.core().cache_key()
    }

    /// Fetch unless deduplicated. See the module docs.
    fn revalidate(self: &Arc<Self>, force: bool) -> BoxFuture<'static, Result<(), QueryError>>
    where
        Self: Sized,
    {
        let query = Arc::clone(self);
        async move {
            let future = {
                let core = query.core();
                let mut state = core.lock_fetch();
                let now = Instant::now();
                if !force && state.pending.is_some() {
                    debug!(cache_key = %core.cache_key, "Joining in-flight fetch");
                    QueryCore::pending(&state)
                } else if !force
                    && state
                        .last_started
                        .is_some_and(|t| now.saturating_duration_since(t) < core.dedupe_interval)
                {
                    debug!(cache_key = %core.cache_key, "Skipping revalidate inside dedupe interval");
                    None
                } else {
                    let fetch = Arc::clone(&query).fetch_and_store();
                    Some(core.start_locked(&mut state, fetch))
                }
            };
            match future {
                Some(future) => future.await,
                None => Ok(()),
            }
        }
        .boxed()
    }

    /// Tombstone this query's entry. No-op if already tombstoned.
    fn delete_from_store(&self, batch: &mut BatchContext<'_>, status: Status) -> bool {
        batch.delete(self.cache_key(), status)
    }
}

/// Closed set of query variants held by the store registry.
#[derive(Clone)]
pub enum RegisteredQuery {
    Object(Arc<ObjectQuery>),
    List(Arc<ListQuery>),
    Link(Arc<SpecificLinkQuery>),
}

impl RegisteredQuery {
    pub fn cache_key(&self) -> CacheKey {
        match self {
            RegisteredQuery::Object(q) => q.cache_key(),
            RegisteredQuery::List(q) => q.cache_key(),
            RegisteredQuery::Link(q) => q.cache_key(),
        }
    }

    /// Object type for objects and lists; source type for links.
    pub fn object_type(&self) -> &str {
        match self {
            RegisteredQuery::Object(q) => q.object_type(),
            RegisteredQuery::List(q) => q.object_type(),
            RegisteredQuery::Link(q) => q.source_type(),
        }
    }

    /// Whether type-wide invalidation of `object_type` reaches this query.
    pub fn concerns_type(&self, object_type: &str) -> bool {
        match self {
            RegisteredQuery::Object(q) => q.object_type() == object_type,
            RegisteredQuery::List(q) => q.object_type() == object_type,
            RegisteredQuery::Link(q) => {
                q.source_type() == object_type || q.target_type() == Some(object_type)
            }
        }
    }

    pub fn revalidate(&self, force: bool) -> BoxFuture<'static, Result<(), QueryError>> {
        match self {
            RegisteredQuery::Object(q) => q.revalidate(force),
            RegisteredQuery::List(q) => q.revalidate(force),
            RegisteredQuery::Link(q) => q.revalidate(force),
        }
    }

    pub(crate) fn maybe_update_and_revalidate(
        &self,
        store: &Store,
        changes: &mut Changes,
        optimistic_id: Option<&OptimisticId>,
    ) -> Option<BoxFuture<'static, Result<(), QueryError>>> {
        match self {
            RegisteredQuery::Object(_) => None,
            RegisteredQuery::List(q) => q.maybe_update_and_revalidate(store, changes, optimistic_id),
            RegisteredQuery::Link(q) => q.maybe_update_and_revalidate(changes),
        }
    }

    pub(crate) fn dispose(&self, state: &mut StoreState) {
        match self {
            RegisteredQuery::Object(_) => {}
            RegisteredQuery::List(q) => q.collection().dispose(q.cache_key(), state),
            RegisteredQuery::Link(q) => q.collection().dispose(q.cache_key(), state),
        }
    }
}

/// How `observe_*` revalidates after subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObserveMode {
    /// Revalidate, joining any in-flight fetch.
    #[default]
    Normal,
    /// Always start a new fetch.
    Force,
    /// Serve what is cached; never hit the network.
    Offline,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ObserveOptions {
    pub mode: ObserveMode,
}

impl ObserveOptions {
    pub fn force() -> Self {
        Self {
            mode: ObserveMode::Force,
        }
    }

    pub fn offline() -> Self {
        Self {
            mode: ObserveMode::Offline,
        }
    }
}
