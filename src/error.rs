//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for cache lookups.
///
/// Only two failures are part of the contract: a plain miss, and a miss
/// where a configured loader was consulted but produced nothing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// Key not found in the table
    #[error("key not found")]
    KeyNotFound,

    /// Key not found and the configured loader could not produce it
    #[error("key not found and could not be loaded")]
    KeyNotFoundOrNotLoadable,
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
