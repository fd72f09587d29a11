//! Filtered, ordered list of objects of one type.

use super::{AutoFetchMore, CollectionCore, CollectionQuery, ListPayload, Query, QueryCore};
use crate::store::Store;
use crate::subject::SubjectPayload;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    CacheKey, Changes, MatchKind, ObjectInstance, OptimisticId, OrderBy, QueryError, Status,
    WhereClause,
};
use tracing::debug;

/// Parameters of a list query. The object type, where clause and order by
/// identify the list; the rest only apply when the query is first created.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub object_type: String,
    pub where_clause: WhereClause,
    pub order_by: OrderBy,
    /// Falls back to the store's default page size.
    pub page_size: Option<u32>,
    pub auto_fetch_more: AutoFetchMore,
    /// Falls back to the store's list dedupe interval.
    pub dedupe_interval: Option<Duration>,
}

impl ListOptions {
    /// Every object of `object_type`, in server order.
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            where_clause: WhereClause::all(),
            order_by: OrderBy::default(),
            page_size: None,
            auto_fetch_more: AutoFetchMore::Off,
            dedupe_interval: None,
        }
    }

    /// Filter the collection. Defaults to matching everything.
    pub fn with_where(mut self, where_clause: WhereClause) -> Self {
        self.where_clause = where_clause;
        self
    }

    /// Sort members. Defaults to server order.
    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    /// Objects per page. Zero is rejected when the query is created.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// How many pages the initial load walks through.
    pub fn with_auto_fetch_more(mut self, auto_fetch_more: AutoFetchMore) -> Self {
        self.auto_fetch_more = auto_fetch_more;
        self
    }

    /// Minimum gap between non-forced revalidations.
    pub fn with_dedupe_interval(mut self, interval: Duration) -> Self {
        self.dedupe_interval = Some(interval);
        self
    }
}

pub struct ListQuery {
    core: QueryCore,
    object_type: String,
    collection: CollectionCore,
}

impl std::fmt::Debug for ListQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListQuery")
            .field("object_type", &self.object_type)
            .finish_non_exhaustive()
    }
}

/// Changed objects of the list's type, sorted by how the where clause
/// judges them.
#[derive(Default)]
struct RelevantObjects {
    added_strict: Vec<Arc<ObjectInstance>>,
    modified_strict: Vec<Arc<ObjectInstance>>,
    /// Modified objects that are no longer a strict match.
    modified_other: Vec<Arc<ObjectInstance>>,
    any_sorta: bool,
}

impl RelevantObjects {
    fn is_empty(&self) -> bool {
        self.added_strict.is_empty()
            && self.modified_strict.is_empty()
            && self.modified_other.is_empty()
            && !self.any_sorta
    }
}

impl ListQuery {
    pub(crate) fn new(core: QueryCore, object_type: String, collection: CollectionCore) -> Self {
        Self {
            core,
            object_type,
            collection,
        }
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    fn categorize(&self, changes: &Changes) -> RelevantObjects {
        let where_clause = self.collection.where_clause();
        let mut relevant = RelevantObjects::default();
        for object in changes.added_of_type(&self.object_type) {
            match where_clause.classify(object) {
                MatchKind::Strict => relevant.added_strict.push(Arc::clone(object)),
                MatchKind::Sorta => relevant.any_sorta = true,
                MatchKind::None => {}
            }
        }
        for object in changes.modified_of_type(&self.object_type) {
            match where_clause.classify(object) {
                MatchKind::Strict => relevant.modified_strict.push(Arc::clone(object)),
                kind => {
                    relevant.any_sorta |= kind == MatchKind::Sorta;
                    relevant.modified_other.push(Arc::clone(object));
                }
            }
        }
        relevant
    }

    /// Patch this list after another batch changed objects of its type.
    ///
    /// Strict matches are inserted in place. Deleted objects, and modified
    /// objects that stopped matching, are dropped (truth batches only).
    /// Objects the where clause cannot judge locally leave the list in
    /// `loading` and, outside optimistic batches, trigger a forced
    /// revalidation whose future is returned. Lists that never loaded are
    /// left alone.
    pub(crate) fn maybe_update_and_revalidate(
        self: &Arc<Self>,
        store: &Store,
        changes: &mut Changes,
        optimistic_id: Option<&OptimisticId>,
    ) -> Option<BoxFuture<'static, Result<(), QueryError>>> {
        let key = self.cache_key();
        if changes.origin == Some(key) || changes.modified.contains(&key) {
            return None;
        }
        changes.modified.insert(key);

        let relevant = self.categorize(changes);
        if relevant.is_empty() && changes.deleted.is_empty() {
            return None;
        }

        let optimistic = optimistic_id.is_some();
        let needs_revalidation = relevant.any_sorta && !optimistic;
        let status = if optimistic || relevant.any_sorta {
            Status::Loading
        } else {
            Status::Loaded
        };
        let deleted = changes.deleted.clone();

        let updated = store.batch_inner(optimistic_id.cloned(), changes, |batch| {
            let Some(existing) = batch.read(key).and_then(|e| e.collection().cloned()) else {
                return false;
            };
            let present: HashSet<CacheKey> = existing.data.iter().copied().collect();

            let mut to_remove = deleted;
            let mut to_add = Vec::new();
            for object in &relevant.added_strict {
                to_add.push(batch.object_key(&object.object_type, &object.primary_key));
            }
            for object in &relevant.modified_strict {
                let member = batch.object_key(&object.object_type, &object.primary_key);
                if !present.contains(&member) {
                    to_add.push(member);
                }
            }
            if !batch.is_optimistic() {
                for object in &relevant.modified_other {
                    to_remove.insert(batch.object_key(&object.object_type, &object.primary_key));
                }
            }

            let next: Vec<CacheKey> = existing
                .data
                .iter()
                .copied()
                .filter(|k| !to_remove.contains(k))
                .chain(to_add)
                .collect();
            if next == existing.data && relevant.modified_strict.is_empty() && !needs_revalidation {
                return false;
            }
            self.collection
                .update_list(key, batch, next, status, false, existing.total_count.clone());
            true
        });

        debug!(
            cache_key = %key,
            updated,
            needs_revalidation,
            optimistic,
            "List patched from changes"
        );
        needs_revalidation.then(|| self.revalidate(true))
    }
}

impl Query for ListQuery {
    type Payload = ListPayload;

    fn core(&self) -> &QueryCore {
        &self.core
    }

    fn to_payload(&self, raw: &SubjectPayload) -> ListPayload {
        self.collection.payload(raw)
    }

    fn fetch_and_store(self: Arc<Self>) -> BoxFuture<'static, Result<(), QueryError>> {
        async move { self.collection.fetch_and_store(&self.core).await }.boxed()
    }
}

impl CollectionQuery for ListQuery {
    fn collection(&self) -> &CollectionCore {
        &self.collection
    }
}
