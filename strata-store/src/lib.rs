//! STRATA Store - Layered Object Cache and Live Queries
//!
//! Client-side cache for ontology objects. Cached values live in a chain of
//! layers: a truth layer holding confirmed server state and optimistic
//! layers stacked on top of it for speculative writes. Queries own cache
//! keys, fetch through an injected [`OntologyFetcher`](strata_core::OntologyFetcher),
//! write results in batches and push every visible change to their
//! subscribers.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use strata_core::{OntologyFetcher, ValidationError};
//! use strata_store::{ListOptions, ObserveOptions, Store};
//! use strata_core::WhereClause;
//!
//! # async fn demo(fetcher: Arc<dyn OntologyFetcher>) -> Result<(), ValidationError> {
//! let store = Store::new(fetcher);
//! let options = ListOptions::new("Employee").with_where(WhereClause::eq("office", "NYC"));
//! let mut employees = store.observe_list(&options, ObserveOptions::default())?;
//! while let Some(payload) = employees.recv().await {
//!     println!("{} ({} members)", payload.status, payload.resolved_list.map_or(0, |l| l.len()));
//! }
//! # Ok(())
//! # }
//! ```

mod batch;
mod layer;
mod lock;
mod query;
mod ref_counts;
mod store;
mod subject;
mod subscription;

// ============================================================================
// CACHE
// ============================================================================

pub use batch::{BatchContext, BatchOptions, BatchOutcome};
pub use layer::Layer;
pub use store::Store;
pub use subject::SubjectPayload;

// ============================================================================
// QUERIES
// ============================================================================

pub use query::{
    AutoFetchMore, CollectionCore, CollectionQuery, LinkOptions, ListOptions, ListPayload,
    ListQuery, ObjectPayload, ObjectQuery, ObserveMode, ObserveOptions, Query, QueryCore,
    RegisteredQuery, SpecificLinkQuery,
};
pub use subscription::{QuerySubscription, Unsubscribable};
