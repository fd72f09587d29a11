//! STRATA Core - Cache Data Model
//!
//! Pure data structures shared by the store and its collaborators: identity
//! types, interned cache keys, where-clause trees and their canonical forms,
//! cache entries, change descriptors, the fetch collaborator trait, config
//! and the error taxonomy. No async runtime lives here.

mod canonical;
mod changes;
mod config;
mod entry;
mod error;
mod fetch;
mod filter;
mod identity;
mod key;
mod order;

// ============================================================================
// IDENTITY
// ============================================================================

pub use identity::{ObjectInstance, OptimisticId, PrimaryKey, Timestamp};

// ============================================================================
// KEYS AND CANONICAL FORMS
// ============================================================================

pub use canonical::{Canonical, OrderByCanonicalizer, WhereClauseCanonicalizer};
pub use filter::{FilterExpr, FilterOperator, MatchKind, WhereClause};
pub use key::{CacheKey, CacheKeyData, CacheKeyKind, CacheKeys, KeyPart};
pub use order::{OrderBy, OrderByClause, SortDirection};

// ============================================================================
// ENTRIES AND CHANGES
// ============================================================================

pub use changes::Changes;
pub use entry::{CacheValue, CollectionData, Entry, Status};

// ============================================================================
// COLLABORATORS, CONFIG, ERRORS
// ============================================================================

pub use config::{StoreConfig, CONFIG_PATH_ENV};
pub use error::{ConfigError, FetchError, QueryError, StrataError, StrataResult, ValidationError};
pub use fetch::{OntologyFetcher, PageRequest, PageResult, PageSource};
