//! Per-datacenter in-memory resource maps
//!
//! Backs both the role and keyspace reconcilers. Entries are keyed first by
//! datacenter identity (`namespace/cluster/datacenter`), then by a secondary
//! name (role username or keyspace name). The map lives for the process
//! lifetime; plugins re-register their entries on every pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug)]
pub struct ResourceManager<T> {
    entries: Arc<RwLock<HashMap<String, BTreeMap<String, T>>>>,
}

impl<T> Clone for ResourceManager<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for ResourceManager<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Clone> ResourceManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dc_key: &str, name: &str) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(dc_key).and_then(|m| m.get(name)).cloned()
    }

    /// Insert the value built by `make` unless an entry already exists.
    ///
    /// Returns true when a new entry was inserted.
    pub fn add_if_absent(&self, dc_key: &str, name: &str, make: impl FnOnce() -> T) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let map = entries.entry(dc_key.to_string()).or_default();
        if map.contains_key(name) {
            return false;
        }
        map.insert(name.to_string(), make());
        true
    }

    pub fn put(&self, dc_key: &str, name: &str, value: T) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(dc_key.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Mutate an existing entry in place, returns false if absent
    pub fn update(&self, dc_key: &str, name: &str, f: impl FnOnce(&mut T)) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(dc_key).and_then(|m| m.get_mut(name)) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, dc_key: &str, name: &str) -> Option<T> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.get_mut(dc_key).and_then(|m| m.remove(name))
    }

    /// Drop entries for which `keep` returns false
    pub fn retain(&self, dc_key: &str, mut keep: impl FnMut(&str, &T) -> bool) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = entries.get_mut(dc_key) {
            map.retain(|name, value| keep(name, value));
        }
    }

    /// Snapshot of a datacenter's entries ordered by name
    pub fn list(&self, dc_key: &str) -> Vec<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(dc_key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove_datacenter(&self, dc_key: &str) -> Option<BTreeMap<String, T>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(dc_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_if_absent_keeps_existing() {
        let manager: ResourceManager<i32> = ResourceManager::new();
        assert!(manager.add_if_absent("ns/cl/dc1", "a", || 1));
        assert!(!manager.add_if_absent("ns/cl/dc1", "a", || 2));
        assert_eq!(manager.get("ns/cl/dc1", "a"), Some(1));
    }

    #[test]
    fn test_datacenters_are_isolated() {
        let manager: ResourceManager<i32> = ResourceManager::new();
        manager.put("ns/cl/dc1", "a", 1);
        manager.put("ns/cl/dc2", "a", 2);
        manager.update("ns/cl/dc1", "a", |v| *v += 10);

        assert_eq!(manager.get("ns/cl/dc1", "a"), Some(11));
        assert_eq!(manager.get("ns/cl/dc2", "a"), Some(2));

        manager.remove_datacenter("ns/cl/dc1");
        assert!(manager.list("ns/cl/dc1").is_empty());
        assert_eq!(manager.list("ns/cl/dc2"), vec![2]);
    }

    #[test]
    fn test_retain() {
        let manager: ResourceManager<i32> = ResourceManager::new();
        manager.put("dc", "a", 1);
        manager.put("dc", "b", 2);
        manager.retain("dc", |_, v| *v > 1);
        assert_eq!(manager.list("dc"), vec![2]);
    }
}
