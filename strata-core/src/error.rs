//! Error types for STRATA operations

use thiserror::Error;

/// Failures reported by the fetch collaborator.
///
/// These are expected in steady state. Queries recover from them locally by
/// writing an `error` status; they never escape `revalidate`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network failure: {reason}")]
    Network { reason: String },

    #[error("Object not found: {object_type} with primary key {primary_key}")]
    NotFound {
        object_type: String,
        primary_key: String,
    },

    #[error("Server responded with status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Failed to decode response: {reason}")]
    Decode { reason: String },
}

/// Precondition violations. These indicate programmer error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Optimistic id must not be empty")]
    EmptyOptimisticId,

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Unexpected failures in fetch orchestration.
///
/// Unlike [`FetchError`], these are written to the cache as `error` status
/// *and* returned to whoever awaits the revalidation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Response for {cache_key} did not match the request: {reason}")]
    ResponseMismatch { cache_key: String, reason: String },

    #[error("Store was dropped while a query was still running")]
    StoreDropped,

    #[error("Background task failed: {reason}")]
    TaskFailed { reason: String },
}

/// Master error type for all STRATA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),
}

/// Result type alias for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;
