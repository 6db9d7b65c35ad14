//! Cache Table Module
//!
//! A named table of cache items with idle-TTL expiration, loader-backed
//! lazy population and lifecycle callbacks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::item::{CacheItem, ItemCallback};
use crate::error::{CacheError, Result};

/// Loader invoked on a cache miss to produce a value and its TTL.
///
/// Runs synchronously on the caller's task with no table lock held.
/// Per-call context is captured by the closure itself.
pub type LoaderFn<K, V> = Arc<dyn Fn(&K) -> Option<(V, Duration)> + Send + Sync>;

// == Cache Table ==
/// A named, independently managed collection of cache items.
///
/// One reader/writer lock guards the item map, the loader, both callback
/// lists and the sweeper state. Structural mutations hold the write lock
/// only for the map work itself; every user-supplied callback and the
/// loader run with no table lock held, so hooks may call back into the
/// same table.
///
/// Expiry is deadline-driven: the table tracks the single nearest expiry
/// across all items and arms exactly one timer for it. There is no polling
/// tick and no per-item timer. Constructors hand out `Arc<CacheTable>`;
/// the timer task holds its table through the weak self-reference, so a
/// sleeping timer never keeps a dropped table alive.
pub struct CacheTable<K, V> {
    /// Table identifier, unique within its registry
    name: String,
    /// Handle the timer task upgrades to reach the table
    self_ref: Weak<CacheTable<K, V>>,
    /// All structural state, behind the table lock
    state: RwLock<TableState<K, V>>,
}

/// State guarded by the table lock.
struct TableState<K, V> {
    /// Key to item mapping; no ordering guarantee
    items: HashMap<K, Arc<CacheItem<K, V>>>,
    /// Consulted on miss to lazily populate the table
    loader: Option<LoaderFn<K, V>>,
    /// Fired after every insertion, in registration order
    added_callbacks: Vec<ItemCallback<K, V>>,
    /// Fired before every removal, in registration order
    before_delete_callbacks: Vec<ItemCallback<K, V>>,
    /// Expiration sweeper bookkeeping
    sweep: SweepState,
}

/// Sweeper bookkeeping: one logical timer per table.
///
/// Arming does not store a task handle; it bumps `epoch` and spawns a
/// sleeper that re-checks the epoch on waking. Any later arm, disarm or
/// flush invalidates outstanding sleepers, which wake, notice the stale
/// epoch and exit without touching the table.
struct SweepState {
    /// Generation counter; a sleeper only acts if its epoch is still current
    epoch: u64,
    /// Remaining duration the current timer was armed for; None = disarmed
    next_wake: Option<Duration>,
}

impl SweepState {
    /// Invalidates any armed timer.
    fn disarm(&mut self) {
        self.epoch += 1;
        self.next_wake = None;
    }
}

impl<K, V> CacheTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates a new, empty table.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        debug!("table {}: created", name);
        Arc::new_cyclic(|self_ref| Self {
            name,
            self_ref: Weak::clone(self_ref),
            state: RwLock::new(TableState {
                items: HashMap::new(),
                loader: None,
                added_callbacks: Vec::new(),
                before_delete_callbacks: Vec::new(),
                sweep: SweepState {
                    epoch: 0,
                    next_wake: None,
                },
            }),
        })
    }

    /// Returns the table's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // == Add ==
    /// Inserts a key/value pair, overwriting any existing item.
    ///
    /// A `ttl` of zero means the item never auto-expires. After the write
    /// lock is released, every added callback fires with the new item;
    /// then, if the new item could expire before the currently armed
    /// deadline, the sweeper is resynced so it cannot be missed.
    ///
    /// Overwriting fires no delete or expiry hooks for the displaced item.
    pub async fn add(&self, key: K, ttl: Duration, value: V) -> Arc<CacheItem<K, V>> {
        let item = Arc::new(CacheItem::new(key, value, ttl));
        let (added, resync) = {
            let mut state = self.state.write().await;
            state.items.insert(item.key().clone(), Arc::clone(&item));
            (state.added_callbacks.clone(), needs_resync(&state.sweep, ttl))
        };

        for callback in &added {
            callback(&item);
        }
        if resync {
            self.sweep().await;
        }
        item
    }

    // == Add If Absent ==
    /// Inserts only if the key is not already present.
    ///
    /// Returns whether insertion occurred. On an existing key this is a
    /// complete no-op: no overwrite, no callbacks, no timer resync.
    pub async fn add_if_absent(&self, key: K, ttl: Duration, value: V) -> bool {
        let (item, added, resync) = {
            let mut state = self.state.write().await;
            if state.items.contains_key(&key) {
                return false;
            }
            let item = Arc::new(CacheItem::new(key, value, ttl));
            state.items.insert(item.key().clone(), Arc::clone(&item));
            let resync = needs_resync(&state.sweep, ttl);
            (item, state.added_callbacks.clone(), resync)
        };

        for callback in &added {
            callback(&item);
        }
        if resync {
            self.sweep().await;
        }
        true
    }

    // == Get ==
    /// Retrieves an item by key.
    ///
    /// A hit touches the item (resets its idle clock, bumps its access
    /// count) and returns it. On a miss the configured loader, if any, is
    /// invoked synchronously with no table lock held; a loaded value is
    /// stored via [`add`](Self::add) (added callbacks fire) and returned.
    ///
    /// # Errors
    /// - [`CacheError::KeyNotFound`] on a miss with no loader configured
    /// - [`CacheError::KeyNotFoundOrNotLoadable`] when the loader was
    ///   consulted but produced nothing; the table is left unchanged
    pub async fn get(&self, key: &K) -> Result<Arc<CacheItem<K, V>>> {
        let (hit, loader) = {
            let state = self.state.read().await;
            (state.items.get(key).map(Arc::clone), state.loader.clone())
        };

        if let Some(item) = hit {
            item.touch();
            return Ok(item);
        }

        match loader {
            Some(load) => match load(key) {
                Some((value, ttl)) => Ok(self.add(key.clone(), ttl, value).await),
                None => Err(CacheError::KeyNotFoundOrNotLoadable),
            },
            None => Err(CacheError::KeyNotFound),
        }
    }

    // == Remove ==
    /// Removes an item by key, returning it.
    ///
    /// The table's before-delete callbacks fire first, then the item's own
    /// pre-expiry callbacks, and only then is the entry taken out of the
    /// map — hooks observe the item still present (`exists` still reports
    /// true while they run).
    ///
    /// # Errors
    /// - [`CacheError::KeyNotFound`] if the key is absent
    pub async fn remove(&self, key: &K) -> Result<Arc<CacheItem<K, V>>> {
        let (item, before_delete) = {
            let state = self.state.read().await;
            let item = state
                .items
                .get(key)
                .map(Arc::clone)
                .ok_or(CacheError::KeyNotFound)?;
            (item, state.before_delete_callbacks.clone())
        };

        for callback in &before_delete {
            callback(&item);
        }
        CacheItem::run_expire_callbacks(&item);

        let mut state = self.state.write().await;
        // An add may have replaced the entry while the hooks ran; only
        // delete the item the hooks were fired for.
        if state
            .items
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &item))
        {
            state.items.remove(key);
        }
        drop(state);

        debug!("table {}: removed item", self.name);
        Ok(item)
    }

    // == Lookups ==
    /// Returns whether the key is present.
    pub async fn exists(&self, key: &K) -> bool {
        self.state.read().await.items.contains_key(key)
    }

    /// Returns the number of items in the table.
    pub async fn count(&self) -> usize {
        self.state.read().await.items.len()
    }

    // == For Each ==
    /// Calls `f` with every key/item pair of a point-in-time snapshot.
    ///
    /// The snapshot is taken under the read lock and iterated after
    /// releasing it: mutations by other callers during the iteration are
    /// not visible to it, and `f` may call back into the table.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &Arc<CacheItem<K, V>>),
    {
        let snapshot: Vec<Arc<CacheItem<K, V>>> = {
            let state = self.state.read().await;
            state.items.values().cloned().collect()
        };
        for item in &snapshot {
            f(item.key(), item);
        }
    }

    // == Flush ==
    /// Empties the table and disarms any pending expiry timer.
    ///
    /// Loader and callback configuration are untouched, and no delete or
    /// expiry hooks fire for the dropped items.
    pub async fn flush(&self) {
        let mut state = self.state.write().await;
        let dropped = state.items.len();
        state.items = HashMap::new();
        state.sweep.disarm();
        drop(state);
        info!("table {}: flushed {} item(s)", self.name, dropped);
    }

    // == Most Accessed ==
    /// Returns up to `count` items, sorted strictly descending by access
    /// count.
    ///
    /// Read-only reporting over a snapshot; the order of items with equal
    /// access counts is unspecified. Returns fewer than `count` items if
    /// the table holds fewer.
    pub async fn most_accessed(&self, count: usize) -> Vec<Arc<CacheItem<K, V>>> {
        let mut ranked: Vec<(u64, Arc<CacheItem<K, V>>)> = {
            let state = self.state.read().await;
            state
                .items
                .values()
                .map(|item| (item.access_count(), Arc::clone(item)))
                .collect()
        };
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.truncate(count);
        ranked.into_iter().map(|(_, item)| item).collect()
    }

    // == Loader ==
    /// Sets the loader consulted on a miss by [`get`](Self::get).
    pub async fn set_loader<F>(&self, f: F)
    where
        F: Fn(&K) -> Option<(V, Duration)> + Send + Sync + 'static,
    {
        self.state.write().await.loader = Some(Arc::new(f));
    }

    // == Added Callbacks ==
    /// Replaces all added callbacks with a single one.
    pub async fn set_added_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        let mut state = self.state.write().await;
        state.added_callbacks.clear();
        state.added_callbacks.push(Arc::new(f));
    }

    /// Appends an added callback; hooks fire in registration order.
    pub async fn add_added_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        self.state.write().await.added_callbacks.push(Arc::new(f));
    }

    /// Empties the added callback list.
    pub async fn clear_added_callbacks(&self) {
        self.state.write().await.added_callbacks.clear();
    }

    // == Before-Delete Callbacks ==
    /// Replaces all before-delete callbacks with a single one.
    pub async fn set_before_delete_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        let mut state = self.state.write().await;
        state.before_delete_callbacks.clear();
        state.before_delete_callbacks.push(Arc::new(f));
    }

    /// Appends a before-delete callback; hooks fire in registration order.
    pub async fn add_before_delete_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<CacheItem<K, V>>) + Send + Sync + 'static,
    {
        self.state
            .write()
            .await
            .before_delete_callbacks
            .push(Arc::new(f));
    }

    /// Empties the before-delete callback list.
    pub async fn clear_before_delete_callbacks(&self) {
        self.state.write().await.before_delete_callbacks.clear();
    }

    // == Expiration Sweep ==
    /// Evicts every item whose idle time has reached its TTL, then arms
    /// exactly one timer for the nearest remaining deadline.
    ///
    /// Runs after an insert that could move the deadline earlier and when
    /// the armed timer fires. Each pass scans under the write lock; evicted
    /// items get their before-delete and pre-expiry hooks with the lock
    /// released and stay in the map until the hooks return, after which the
    /// map is re-scanned. When no expired items remain the nearest deadline
    /// is armed, or the timer is disarmed if no item carries a positive
    /// TTL — an empty or TTL-free table causes no wake-ups at all.
    async fn sweep(&self) {
        let mut evicted = 0usize;
        let mut state = self.state.write().await;
        loop {
            let now = Instant::now();
            let mut expired: Vec<Arc<CacheItem<K, V>>> = Vec::new();
            let mut next_due: Option<Duration> = None;

            for item in state.items.values() {
                let ttl = item.ttl();
                if ttl.is_zero() {
                    continue;
                }
                let idle = now.saturating_duration_since(item.accessed());
                if idle >= ttl {
                    expired.push(Arc::clone(item));
                } else {
                    let remaining = ttl - idle;
                    next_due = Some(next_due.map_or(remaining, |d| d.min(remaining)));
                }
            }

            if expired.is_empty() {
                match next_due {
                    Some(wake_in) => self.arm_timer(&mut state, wake_in),
                    None => state.sweep.disarm(),
                }
                break;
            }

            let before_delete = state.before_delete_callbacks.clone();
            drop(state);

            for item in &expired {
                for callback in &before_delete {
                    callback(item);
                }
                CacheItem::run_expire_callbacks(item);
            }

            state = self.state.write().await;
            for item in &expired {
                if state
                    .items
                    .get(item.key())
                    .is_some_and(|current| Arc::ptr_eq(current, item))
                {
                    state.items.remove(item.key());
                    evicted += 1;
                }
            }
            // Re-scan: the hooks ran unlocked, the map may have changed.
        }
        drop(state);

        if evicted > 0 {
            debug!("table {}: expired {} item(s)", self.name, evicted);
        }
    }

    /// Arms the single expiry timer for `wake_in` from now.
    ///
    /// Bumping the epoch invalidates any previously armed timer. The
    /// sleeper re-checks the epoch on waking, so a timer superseded by a
    /// re-arm or a flush is a no-op. The sleeper holds its table weakly:
    /// a table dropped while the timer sleeps is simply never swept.
    fn arm_timer(&self, state: &mut TableState<K, V>, wake_in: Duration) {
        state.sweep.epoch += 1;
        state.sweep.next_wake = Some(wake_in);

        let epoch = state.sweep.epoch;
        let handle = Weak::clone(&self.self_ref);
        tokio::spawn(async move {
            tokio::time::sleep(wake_in).await;
            let Some(table) = handle.upgrade() else {
                return;
            };
            if table.state.read().await.sweep.epoch == epoch {
                table.sweep().await;
            }
        });
        debug!("table {}: next expiry check in {:?}", self.name, wake_in);
    }
}

/// Whether an insert with this TTL could expire before the armed deadline.
fn needs_resync(sweep: &SweepState, ttl: Duration) -> bool {
    !ttl.is_zero() && sweep.next_wake.map_or(true, |wake| ttl < wake)
}
