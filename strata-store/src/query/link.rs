//! Objects reachable from one source object over one named link.

use super::{AutoFetchMore, CollectionCore, CollectionQuery, ListPayload, Query, QueryCore};
use crate::subject::SubjectPayload;
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Changes, OrderBy, PrimaryKey, QueryError, WhereClause};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub source_type: String,
    pub primary_key: PrimaryKey,
    pub link_name: String,
    /// Type of the linked objects. When set, responses are checked against
    /// it and type-wide invalidation of the target type reaches this query.
    pub target_type: Option<String>,
    pub where_clause: WhereClause,
    pub order_by: OrderBy,
    pub page_size: Option<u32>,
    pub auto_fetch_more: AutoFetchMore,
    pub dedupe_interval: Option<Duration>,
}

impl LinkOptions {
    /// Objects linked from `source_type`/`primary_key` over `link_name`.
    pub fn new(
        source_type: impl Into<String>,
        primary_key: impl Into<PrimaryKey>,
        link_name: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            primary_key: primary_key.into(),
            link_name: link_name.into(),
            target_type: None,
            where_clause: WhereClause::all(),
            order_by: OrderBy::default(),
            page_size: None,
            auto_fetch_more: AutoFetchMore::Off,
            dedupe_interval: None,
        }
    }

    /// Declare the type of the linked objects.
    pub fn with_target_type(mut self, target_type: impl Into<String>) -> Self {
        self.target_type = Some(target_type.into());
        self
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

pub struct SpecificLinkQuery {
    core: QueryCore,
    source_type: String,
    primary_key: PrimaryKey,
    link_name: String,
    target_type: Option<String>,
    collection: CollectionCore,
}

impl SpecificLinkQuery {
    pub(crate) fn new(core: QueryCore, options: &LinkOptions, collection: CollectionCore) -> Self {
        Self {
            core,
            source_type: options.source_type.clone(),
            primary_key: options.primary_key.clone(),
            link_name: options.link_name.clone(),
            target_type: options.target_type.clone(),
            collection,
        }
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub fn target_type(&self) -> Option<&str> {
        self.target_type.as_deref()
    }

    /// Re-fetch when another batch marked this link modified.
    pub(crate) fn maybe_update_and_revalidate(
        self: &Arc<Self>,
        changes: &mut Changes,
    ) -> Option<BoxFuture<'static, Result<(), QueryError>>> {
        let key = self.cache_key();
        if !changes.modified.contains(&key) || changes.origin == Some(key) {
            return None;
        }
        debug!(cache_key = %key, link = %self.link_name, "Link marked modified, revalidating");
        Some(self.revalidate(true))
    }
}

impl Query for SpecificLinkQuery {
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

impl CollectionQuery for SpecificLinkQuery {
    fn collection(&self) -> &CollectionCore {
        &self.collection
    }
}
