//! Fetch collaborator interface
//!
//! The cache never talks HTTP. Everything it needs from the network is
//! behind [`OntologyFetcher`], which the embedding application implements
//! over its transport of choice.

use crate::{FetchError, ObjectInstance, OrderBy, PrimaryKey, WhereClause};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a page of objects is drawn from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageSource {
    /// All objects of a type.
    ObjectType(String),
    /// Objects reachable from one source object over a named link.
    Link {
        source_type: String,
        primary_key: PrimaryKey,
        link_name: String,
    },
}

impl PageSource {
    pub fn object_type(object_type: impl Into<String>) -> Self {
        PageSource::ObjectType(object_type.into())
    }
}

/// Request for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub source: PageSource,
    pub where_clause: WhereClause,
    pub order_by: OrderBy,
    pub page_size: u32,
    pub page_token: Option<String>,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageResult {
    pub data: Vec<ObjectInstance>,
    pub next_page_token: Option<String>,
    pub total_count: Option<String>,
}

/// Network capability injected into the store.
#[async_trait]
pub trait OntologyFetcher: Send + Sync {
    /// Fetch one object by primary key.
    async fn fetch_object(
        &self,
        object_type: &str,
        primary_key: &PrimaryKey,
    ) -> Result<ObjectInstance, FetchError>;

    /// Fetch one page of a filtered, ordered collection.
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult, FetchError>;
}
