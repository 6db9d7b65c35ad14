//! Table Cache - A lightweight in-process cache library
//!
//! Provides named cache tables with idle-TTL expiration, loader-backed lazy
//! population and lifecycle callbacks.

pub mod cache;
pub mod error;

pub use cache::{CacheItem, CacheRegistry, CacheTable, ItemCallback, LoaderFn};
pub use error::{CacheError, Result};
