//! Single-object query.

use super::{Query, QueryCore};
use crate::batch::BatchContext;
use crate::subject::SubjectPayload;
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use strata_core::{CacheKey, ObjectInstance, PrimaryKey, QueryError, Status, Timestamp};
use tracing::{debug, warn};

/// Payload delivered to object subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPayload {
    /// `None` until loaded, and after deletion.
    pub object: Option<Arc<ObjectInstance>>,
    pub status: Status,
    pub last_updated: Timestamp,
    pub is_optimistic: bool,
}

/// Keeps one object at its cache key fresh.
pub struct ObjectQuery {
    core: QueryCore,
    object_type: String,
    primary_key: PrimaryKey,
}

impl ObjectQuery {
    pub(crate) fn new(core: QueryCore, object_type: String, primary_key: PrimaryKey) -> Self {
        Self {
            core,
            object_type,
            primary_key,
        }
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    /// Write `object` at this query's key, or tombstone the key when `None`.
    pub fn write_to_store(
        &self,
        batch: &mut BatchContext<'_>,
        object: Option<ObjectInstance>,
        status: Status,
    ) -> CacheKey {
        match object {
            Some(object) => batch.write_object(object, status),
            None => {
                self.delete_from_store(batch, status);
                self.cache_key()
            }
        }
    }

    fn check_identity(&self, object: &ObjectInstance) -> Result<(), QueryError> {
        if object.object_type == self.object_type && object.primary_key == self.primary_key {
            return Ok(());
        }
        Err(QueryError::ResponseMismatch {
            cache_key: self.cache_key().to_string(),
            reason: format!(
                "asked for {}:{}, got {}:{}",
                self.object_type, self.primary_key, object.object_type, object.primary_key
            ),
        })
    }
}

impl Query for ObjectQuery {
    type Payload = ObjectPayload;

    fn core(&self) -> &QueryCore {
        &self.core
    }

    fn to_payload(&self, raw: &SubjectPayload) -> ObjectPayload {
        ObjectPayload {
            object: raw.entry.object().cloned(),
            status: raw.entry.status,
            last_updated: raw.entry.last_updated,
            is_optimistic: raw.is_optimistic,
        }
    }

    fn fetch_and_store(self: Arc<Self>) -> BoxFuture<'static, Result<(), QueryError>> {
        async move {
            let store = self.core.store()?;
            let key = self.cache_key();
            debug!(
                cache_key = %key,
                object_type = %self.object_type,
                primary_key = %self.primary_key,
                "Fetching object"
            );
            store.batch_from(key, |batch| {
                batch.set_status(key, Status::Loading);
            });

            match store
                .fetcher()
                .fetch_object(&self.object_type, &self.primary_key)
                .await
            {
                Ok(object) => {
                    self.check_identity(&object)?;
                    store.batch_from(key, |batch| {
                        self.write_to_store(batch, Some(object), Status::Loaded);
                    });
                }
                Err(err) => {
                    warn!(cache_key = %key, error = %err, "Object fetch failed, recording error status");
                    store.batch_from(key, |batch| {
                        batch.set_status(key, Status::Error);
                    });
                }
            }
            Ok(())
        }
        .boxed()
    }
}
