//! Latest-known state of watched resources, one cache per resource kind

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::watch::ResourceEvent;

#[derive(Debug)]
pub struct ResourceCache<R> {
    entries: Arc<RwLock<HashMap<String, R>>>,
}

impl<R> Clone for ResourceCache<R> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<R> Default for ResourceCache<R> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<R: Clone> ResourceCache<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, resource: R) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.into(), resource);
    }

    pub fn remove(&self, key: &str) -> Option<R> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<R> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    pub fn values(&self) -> Vec<R> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upsert on INITIAL/ADDED/MODIFIED, remove on DELETED, ignore errors
    pub fn apply(&self, event: &ResourceEvent<R>) {
        match event {
            ResourceEvent::Initial { key, resource }
            | ResourceEvent::Added { key, resource }
            | ResourceEvent::Modified { key, resource } => self.put(key.clone(), resource.clone()),
            ResourceEvent::Deleted { key, .. } => {
                self.remove(key);
            }
            ResourceEvent::Error { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_events() {
        let cache: ResourceCache<u32> = ResourceCache::new();
        cache.apply(&ResourceEvent::Initial {
            key: "a".to_string(),
            resource: 1,
        });
        cache.apply(&ResourceEvent::Modified {
            key: "a".to_string(),
            resource: 2,
        });
        cache.apply(&ResourceEvent::Added {
            key: "b".to_string(),
            resource: 3,
        });
        cache.apply(&ResourceEvent::Error {
            message: "gone".to_string(),
        });
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.len(), 2);

        cache.apply(&ResourceEvent::Deleted {
            key: "b".to_string(),
            resource: 3,
        });
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache: ResourceCache<&str> = ResourceCache::new();
        let reader = cache.clone();
        cache.put("ns/dc1", "v1");
        assert_eq!(reader.get("ns/dc1"), Some("v1"));
    }

    #[test]
    fn test_writes_from_other_tasks_are_visible() {
        let cache: ResourceCache<u32> = ResourceCache::new();
        let writer = cache.clone();
        tokio_test::block_on(async move {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let writer = writer.clone();
                    tokio::spawn(async move { writer.put(format!("ns/dc{i}"), i) })
                })
                .collect();
            for handle in handles {
                tokio_test::assert_ok!(handle.await);
            }
        });
        assert_eq!(cache.len(), 8);
        assert_eq!(cache.get("ns/dc7"), Some(7));
    }
}
