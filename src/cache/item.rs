//! Cache Item Module
//!
//! Defines a single cached key/value pair with access metadata and
//! pre-expiry callbacks.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Hook invoked with a cache item, in registration order.
///
/// Used for the per-item pre-expiry list as well as the table-level
/// added and before-delete lists.
pub type ItemCallback<K, V> = Arc<dyn Fn(&Arc<CacheItem<K, V>>) + Send + Sync>;

// == Cache Item ==
/// A single cached key/value pair with TTL and access metadata.
///
/// Key, value, TTL and creation timestamp are fixed for the lifetime of the
/// item; overwriting a key in a table installs a fresh item. The access
/// metadata and the pre-expiry callback list live behind the item's own
/// lock, independent of any table-level locking, so touching one item never
/// contends with operations on another.
pub struct CacheItem<K, V> {
    /// The key this item is stored under, unique within its table
    key: K,
    /// The cached payload
    value: V,
    /// Idle duration after which the item expires; zero = never
    ttl: Duration,
    /// Wall-clock creation timestamp
    created_on: DateTime<Utc>,
    /// Mutable access metadata, guarded by the item lock
    state: RwLock<ItemState<K, V>>,
}

/// Metadata mutated by accesses and callback-list edits.
struct ItemState<K, V> {
    /// Monotonic last-access instant; the only input to expiry arithmetic
    accessed: Instant,
    /// Wall-clock last-access timestamp, for reporting
    accessed_on: DateTime<Utc>,
    /// Number of successful accesses
    access_count: u64,
    /// Hooks fired immediately before this item is removed
    expire_callbacks: Vec<ItemCallback<K, V>>,
}

impl<K, V> CacheItem<K, V> {
    // == Constructor ==
    /// Creates a new item with both timestamps set to now and a zero
    /// access count.
    pub(crate) fn new(key: K, value: V, ttl: Duration) -> Self {
        Self {
            key,
            value,
            ttl,
            created_on: Utc::now(),
            state: RwLock::new(ItemState {
                accessed: Instant::now(),
                accessed_on: Utc::now(),
                access_count: 0,
                expire_callbacks: Vec::new(),
            }),
        }
    }

    // == Touch ==
    /// Marks the item as accessed: resets the idle clock and increments the
    /// access count.
    ///
    /// Called on every successful table lookup. An item touched more often
    /// than its TTL never expires.
    pub fn touch(&self) {
        let mut state = self.write_state();
        state.accessed = Instant::now();
        state.accessed_on = Utc::now();
        state.access_count += 1;
    }

    // == Accessors ==
    /// Returns the item's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the cached value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Returns the idle duration after which the item expires.
    /// Zero means the item never auto-expires.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the wall-clock creation timestamp.
    pub fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    /// Returns the wall-clock timestamp of the last successful access.
    pub fn accessed_on(&self) -> DateTime<Utc> {
        self.read_state().accessed_on
    }

    /// Returns how often the item has been accessed.
    pub fn access_count(&self) -> u64 {
        self.read_state().access_count
    }

    /// Monotonic instant of the last access, used by the expiry sweep.
    pub(crate) fn accessed(&self) -> Instant {
        self.read_state().accessed
    }

    // == Pre-Expiry Callbacks ==
    /// Replaces any existing pre-expiry callbacks with a single one.
    pub fn set_expire_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        let mut state = self.write_state();
        state.expire_callbacks.clear();
        state.expire_callbacks.push(Arc::new(f));
    }

    /// Appends a pre-expiry callback; hooks fire in registration order.
    pub fn add_expire_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        self.write_state().expire_callbacks.push(Arc::new(f));
    }

    /// Empties the pre-expiry callback list.
    pub fn clear_expire_callbacks(&self) {
        self.write_state().expire_callbacks.clear();
    }

    /// Fires the pre-expiry callbacks with the item itself.
    ///
    /// The list is snapshotted under the item lock and invoked after
    /// releasing it, so a hook may edit the list it was registered on.
    pub(crate) fn run_expire_callbacks(item: &Arc<Self>) {
        let callbacks = item.read_state().expire_callbacks.clone();
        for callback in &callbacks {
            callback(item);
        }
    }

    // == Lock Helpers ==
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ItemState<K, V>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ItemState<K, V>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K: std::fmt::Debug, V> std::fmt::Debug for CacheItem<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheItem")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("created_on", &self.created_on)
            .field("access_count", &self.access_count())
            .finish()
    }
}
