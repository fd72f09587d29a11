//! Machinery shared by list and link queries.
//!
//! A collection's value is the ordered list of its members' object keys.
//! Member objects live at their own keys, so an update to one object shows
//! up in every collection that references it without a re-fetch.

use super::{Query, QueryCore};
use crate::batch::BatchContext;
use crate::lock::mutex_lock;
use crate::store::StoreState;
use crate::subject::SubjectPayload;
use futures_util::future::{BoxFuture, FutureExt};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use strata_core::{
    CacheKey, CacheValue, Canonical, CollectionData, ObjectInstance, OrderBy, PageRequest,
    PageResult, PageSource, QueryError, Status, Timestamp, ValidationError, WhereClause,
};
use tracing::{debug, warn};

/// How many results the initial load tries to reach before stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoFetchMore {
    /// One page.
    #[default]
    Off,
    /// Every page.
    All,
    /// Pages until at least this many results are loaded.
    AtLeast(usize),
}

impl AutoFetchMore {
    pub fn min_results(self) -> usize {
        match self {
            AutoFetchMore::Off => 0,
            AutoFetchMore::All => usize::MAX,
            AutoFetchMore::AtLeast(n) => n,
        }
    }
}

/// Page size for a new collection query: the requested size, or `default`
/// when none was given. Zero is rejected.
pub(crate) fn resolve_page_size(
    requested: Option<u32>,
    default: u32,
) -> Result<u32, ValidationError> {
    match requested {
        Some(0) => Err(ValidationError::InvalidValue {
            field: "page_size".to_string(),
            reason: "must be > 0".to_string(),
        }),
        Some(page_size) => Ok(page_size),
        None => Ok(default),
    }
}

/// Payload delivered to list and link subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPayload {
    /// Member objects in list order, `None` until the first load.
    pub resolved_list: Option<Vec<Arc<ObjectInstance>>>,
    pub status: Status,
    pub last_updated: Timestamp,
    pub is_optimistic: bool,
    pub has_more: bool,
    pub total_count: Option<String>,
}

pub struct CollectionCore {
    source: PageSource,
    /// Type every returned object must have, when known.
    member_type: Option<String>,
    where_clause: Canonical<WhereClause>,
    order_by: Canonical<OrderBy>,
    page_size: u32,
    min_results_to_load: usize,
    next_page_token: Mutex<Option<String>>,
    /// Members this query instance currently holds a retain on.
    retained: Mutex<Vec<CacheKey>>,
}

impl CollectionCore {
    pub(crate) fn new(
        source: PageSource,
        member_type: Option<String>,
        where_clause: Canonical<WhereClause>,
        order_by: Canonical<OrderBy>,
        page_size: u32,
        auto_fetch_more: AutoFetchMore,
    ) -> Self {
        Self {
            source,
            member_type,
            where_clause,
            order_by,
            page_size,
            min_results_to_load: auto_fetch_more.min_results(),
            next_page_token: Mutex::new(None),
            retained: Mutex::new(Vec::new()),
        }
    }

    pub fn source(&self) -> &PageSource {
        &self.source
    }

    pub fn where_clause(&self) -> &Canonical<WhereClause> {
        &self.where_clause
    }

    pub fn order_by(&self) -> &Canonical<OrderBy> {
        &self.order_by
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.next_page_token().is_some()
    }

    fn next_page_token(&self) -> Option<String> {
        mutex_lock(&self.next_page_token, "collection", "read_token").clone()
    }

    fn set_next_page_token(&self, token: Option<String>) {
        *mutex_lock(&self.next_page_token, "collection", "write_token") = token;
    }

    pub(crate) fn payload(&self, raw: &SubjectPayload) -> ListPayload {
        ListPayload {
            resolved_list: raw.members.as_ref().map(|m| m.to_vec()),
            status: raw.entry.status,
            last_updated: raw.entry.last_updated,
            is_optimistic: raw.is_optimistic,
            has_more: self.has_more(),
            total_count: raw
                .entry
                .collection()
                .and_then(|c| c.total_count.clone()),
        }
    }

    /// Initial load: mark the list `loading` (keeping its members), reset
    /// paging, then fetch pages until enough results are loaded or none
    /// remain.
    pub(crate) async fn fetch_and_store(&self, core: &QueryCore) -> Result<(), QueryError> {
        let key = core.cache_key();
        core.store()?.batch_from(key, |batch| {
            batch.set_status(key, Status::Loading);
        });
        self.set_next_page_token(None);
        loop {
            match self.fetch_page_and_update(core, Status::Loading).await? {
                None => return Ok(()),
                Some(count) if count >= self.min_results_to_load || !self.has_more() => break,
                Some(_) => {}
            }
        }
        core.store()?.batch_from(key, |batch| {
            batch.set_status(key, Status::Loaded);
        });
        Ok(())
    }

    /// Fetch the next page and merge it in. Returns the list length after
    /// the write, or `None` if the fetch failed and error status was
    /// recorded instead.
    pub(crate) async fn fetch_page_and_update(
        &self,
        core: &QueryCore,
        status: Status,
    ) -> Result<Option<usize>, QueryError> {
        let store = core.store()?;
        let key = core.cache_key();
        let page_token = self.next_page_token();
        let append = page_token.is_some();
        let request = PageRequest {
            source: self.source.clone(),
            where_clause: (*self.where_clause).clone(),
            order_by: (*self.order_by).clone(),
            page_size: self.page_size,
            page_token,
        };

        debug!(cache_key = %key, append, page_size = self.page_size, "Fetching page");
        let page = match store.fetcher().fetch_page(&request).await {
            Ok(page) => page,
            Err(err) => {
                warn!(cache_key = %key, error = %err, "Page fetch failed, recording error status");
                store.batch_from(key, |batch| {
                    batch.set_status(key, Status::Error);
                });
                return Ok(None);
            }
        };

        if let Some(expected) = &self.member_type {
            if let Some(stray) = page.data.iter().find(|o| &o.object_type != expected) {
                return Err(QueryError::ResponseMismatch {
                    cache_key: key.to_string(),
                    reason: format!("expected {} objects, got {}", expected, stray.object_type),
                });
            }
        }

        let PageResult {
            data,
            next_page_token,
            total_count,
        } = page;
        let final_status = if next_page_token.is_some() {
            status
        } else {
            Status::Loaded
        };
        self.set_next_page_token(next_page_token);

        let count = store.batch_from(key, |batch| {
            let members: Vec<CacheKey> = data
                .into_iter()
                .map(|object| batch.write_object(object, Status::Loaded))
                .collect();
            self.update_list(key, batch, members, final_status, append, total_count)
        });
        Ok(Some(count))
    }

    /// Write a new member list. Appends to the existing list when `append`
    /// is set, then sorts, removes duplicates and tombstoned members, and
    /// moves this query's retains onto the new members (truth writes only).
    /// Returns the resulting length.
    pub(crate) fn update_list(
        &self,
        key: CacheKey,
        batch: &mut BatchContext<'_>,
        incoming: Vec<CacheKey>,
        status: Status,
        append: bool,
        total_count: Option<String>,
    ) -> usize {
        let existing: Vec<CacheKey> = batch
            .read(key)
            .and_then(|e| e.collection().map(|c| c.data.clone()))
            .unwrap_or_default();

        let mut data = if append {
            existing.iter().copied().chain(incoming).collect()
        } else {
            incoming
        };
        if !self.order_by.is_empty() {
            sort_members(&mut data, &self.order_by, batch);
        }
        remove_duplicates(&mut data, batch);

        if !batch.is_optimistic() {
            let mut retained = mutex_lock(&self.retained, "collection", "move_retains");
            for member in &data {
                batch.retain(*member);
            }
            for member in retained.drain(..) {
                batch.release(member);
            }
            retained.extend(data.iter().copied());
        }

        let len = data.len();
        let value = CacheValue::Collection(Arc::new(CollectionData { data, total_count }));
        if batch.write_if_changed(key, Some(value), status) {
            batch.changes().register_list(key);
        }
        len
    }

    /// Release every retain this query instance took on its members.
    pub(crate) fn dispose(&self, key: CacheKey, state: &mut StoreState) {
        let members = std::mem::take(&mut *mutex_lock(&self.retained, "collection", "dispose"));
        debug!(cache_key = %key, members = members.len(), "Releasing collection members");
        for member in members {
            state.release(member);
        }
    }
}

/// Collection variants: lists and links.
pub trait CollectionQuery: Query<Payload = ListPayload> {
    fn collection(&self) -> &CollectionCore;

    fn has_more(&self) -> bool {
        self.collection().has_more()
    }

    /// Load the next page. Waits for an in-flight fetch first, and is a
    /// no-op once every page is loaded.
    fn fetch_more(self: &Arc<Self>) -> BoxFuture<'static, Result<(), QueryError>>
    where
        Self: Sized,
    {
        let query = Arc::clone(self);
        async move {
            loop {
                let (future, started_here) = {
                    let core = query.core();
                    let mut state = core.lock_fetch();
                    if let Some(in_flight) = QueryCore::pending(&state) {
                        (in_flight, false)
                    } else if !query.has_more() {
                        return Ok(());
                    } else {
                        let q = Arc::clone(&query);
                        let fetch = async move {
                            let key = q.cache_key();
                            q.core().store()?.batch_from(key, |batch| {
                                batch.set_status(key, Status::Loading);
                            });
                            q.collection()
                                .fetch_page_and_update(q.core(), Status::Loaded)
                                .await
                                .map(|_| ())
                        }
                        .boxed();
                        (core.start_locked(&mut state, fetch), true)
                    }
                };
                let result = future.await;
                if started_here {
                    return result;
                }
            }
        }
        .boxed()
    }
}

fn sort_members(members: &mut [CacheKey], order_by: &OrderBy, batch: &BatchContext<'_>) {
    let objects: HashMap<CacheKey, Arc<ObjectInstance>> = members
        .iter()
        .filter_map(|k| batch.read(*k).and_then(|e| e.object().cloned()).map(|o| (*k, o)))
        .collect();
    members.sort_by(|a, b| match (objects.get(a), objects.get(b)) {
        (Some(x), Some(y)) => order_by.compare(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

fn remove_duplicates(members: &mut Vec<CacheKey>, batch: &BatchContext<'_>) {
    let mut seen = HashSet::with_capacity(members.len());
    members.retain(|k| seen.insert(*k) && !batch.read(*k).is_some_and(|e| e.is_tombstone()));
}
