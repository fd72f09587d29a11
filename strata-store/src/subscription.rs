//! Subscriber handles.

use crate::query::{CollectionQuery, Query};
use crate::store::Store;
use crate::subject::SubjectPayload;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use strata_core::{CacheKey, QueryError};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::trace;

/// A retained subscription to one query.
///
/// The first payload received is the state at subscribe time. Dropping the
/// subscription releases its retain on the query's key; the channel closes
/// when the key is collected.
pub struct QuerySubscription<Q: Query> {
    store: Store,
    query: Arc<Q>,
    receiver: UnboundedReceiver<SubjectPayload>,
    released: bool,
}

impl<Q: Query> QuerySubscription<Q> {
    pub(crate) fn new(store: Store, query: Arc<Q>, receiver: UnboundedReceiver<SubjectPayload>) -> Self {
        Self {
            store,
            query,
            receiver,
            released: false,
        }
    }

    pub fn query(&self) -> &Arc<Q> {
        &self.query
    }

    pub fn cache_key(&self) -> CacheKey {
        self.query.cache_key()
    }

    /// Next payload, or `None` once the subject is gone.
    pub async fn recv(&mut self) -> Option<Q::Payload> {
        let raw = self.receiver.recv().await?;
        Some(self.query.to_payload(&raw))
    }

    /// Next payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<Q::Payload> {
        match self.receiver.try_recv() {
            Ok(raw) => Some(self.query.to_payload(&raw)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Skip queued payloads and return the newest one.
    pub fn latest(&mut self) -> Option<Q::Payload> {
        let mut latest = None;
        while let Ok(raw) = self.receiver.try_recv() {
            latest = Some(raw);
        }
        latest.map(|raw| self.query.to_payload(&raw))
    }

    /// Re-fetch, joining an in-flight fetch unless `force` is set.
    pub fn revalidate(&self, force: bool) -> BoxFuture<'static, Result<(), QueryError>> {
        self.query.revalidate(force)
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Hand every payload to `callback` on a background task.
    pub fn spawn_callback<F>(self, mut callback: F) -> Unsubscribable
    where
        F: FnMut(Q::Payload) + Send + 'static,
    {
        let key = self.cache_key();
        let mut subscription = self;
        let task = tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                callback(payload);
            }
            trace!(cache_key = %key, "Subscription stream ended");
        });
        Unsubscribable { task }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.store.release(self.query.cache_key());
        }
    }
}

impl<Q: CollectionQuery> QuerySubscription<Q> {
    /// Load the next page of the collection.
    pub fn fetch_more(&self) -> BoxFuture<'static, Result<(), QueryError>> {
        self.query.fetch_more()
    }

    pub fn has_more(&self) -> bool {
        self.query.has_more()
    }
}

impl<Q: Query> Drop for QuerySubscription<Q> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle to a callback subscription started with
/// [`QuerySubscription::spawn_callback`].
#[derive(Debug)]
pub struct Unsubscribable {
    task: JoinHandle<()>,
}

impl Unsubscribable {
    /// Stop delivering payloads and release the subscription.
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}
