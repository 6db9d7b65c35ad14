//! Table Registry Module
//!
//! Name-keyed lookup and lazy creation of cache tables.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::cache::table::CacheTable;

// == Cache Registry ==
/// Hands out one shared [`CacheTable`] per name, creating it on first
/// lookup.
///
/// The registry lock is its own and is never held while any table lock is
/// taken. Tables live as long as the registry (and any handles cloned out
/// of it); there is no destroy operation.
pub struct CacheRegistry<K, V> {
    tables: RwLock<HashMap<String, Arc<CacheTable<K, V>>>>,
}

impl<K, V> CacheRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the table registered under `name`, creating it if absent.
    ///
    /// Existing tables are resolved under the read lock; creation retries
    /// the lookup under the write lock, so concurrent callers always end
    /// up with the same instance.
    pub fn table(&self, name: &str) -> Arc<CacheTable<K, V>> {
        {
            let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
            if let Some(table) = tables.get(name) {
                return Arc::clone(table);
            }
        }

        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            tables
                .entry(name.to_string())
                .or_insert_with(|| CacheTable::new(name)),
        )
    }

    /// Returns whether a table is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Returns the number of registered tables.
    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true if no table has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for CacheRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creates_on_first_lookup() {
        let registry: CacheRegistry<String, String> = CacheRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.contains("users"));

        let table = registry.table("users");
        assert_eq!(table.name(), "users");
        assert!(registry.contains("users"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_returns_same_instance() {
        let registry: CacheRegistry<String, String> = CacheRegistry::new();

        let first = registry.table("users");
        let second = registry.table("users");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_distinct_names_distinct_tables() {
        let registry: CacheRegistry<String, String> = CacheRegistry::new();

        let users = registry.table("users");
        let sessions = registry.table("sessions");

        assert!(!Arc::ptr_eq(&users, &sessions));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_shared_across_threads() {
        let registry: Arc<CacheRegistry<String, String>> = Arc::new(CacheRegistry::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.table("shared"))
            })
            .collect();

        let tables: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(registry.len(), 1);
        for table in &tables[1..] {
            assert!(Arc::ptr_eq(&tables[0], table));
        }
    }
}
