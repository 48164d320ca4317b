//! Bounded TTL cache for relationship classifications.
//!
//! The cache is owned by whoever builds the classifier and passed in
//! explicitly; there is no process-wide instance. Keys are a SHA-256 of the
//! two chunk ids in sorted order, so `(a, b)` and `(b, a)` share an entry.
//! Lookups take a read lock; inserts take a write lock and evict expired
//! entries first, then the oldest ones, to stay within capacity.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::models::{ClassificationMethod, RelationshipClassification};

struct Entry {
    value: RelationshipClassification,
    inserted: Instant,
}

pub struct ClassificationCache {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    capacity: usize,
}

impl ClassificationCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Order-independent key for a chunk pair.
    pub fn key(a: &str, b: &str) -> String {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(first.as_bytes());
        hasher.update([0u8]);
        hasher.update(second.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// A live entry for the pair, tagged [`ClassificationMethod::Cached`].
    pub fn get(&self, a: &str, b: &str) -> Option<RelationshipClassification> {
        let key = Self::key(a, b);
        let entries = self.entries.read().expect("classification cache lock poisoned");
        let entry = entries.get(&key)?;
        if entry.inserted.elapsed() >= self.ttl {
            return None;
        }
        let mut hit = entry.value.clone();
        hit.method = ClassificationMethod::Cached;
        Some(hit)
    }

    pub fn insert(&self, a: &str, b: &str, value: RelationshipClassification) {
        let key = Self::key(a, b);
        let mut entries = self
            .entries
            .write()
            .expect("classification cache lock poisoned");

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted.elapsed() < ttl);
            while entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("classification cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .expect("classification cache lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelationshipType;

    fn verdict() -> RelationshipClassification {
        RelationshipClassification::rule(RelationshipType::Equivalent, 0.95, "near-identical")
    }

    #[test]
    fn key_ignores_pair_order() {
        assert_eq!(
            ClassificationCache::key("a", "b"),
            ClassificationCache::key("b", "a")
        );
        assert_ne!(
            ClassificationCache::key("ab", "c"),
            ClassificationCache::key("a", "bc")
        );
    }

    #[test]
    fn hit_is_tagged_cached() {
        let cache = ClassificationCache::new(Duration::from_secs(60), 10);
        cache.insert("x", "y", verdict());
        let hit = cache.get("y", "x").unwrap();
        assert_eq!(hit.method, ClassificationMethod::Cached);
        assert_eq!(hit.relationship, RelationshipType::Equivalent);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = ClassificationCache::new(Duration::ZERO, 10);
        cache.insert("x", "y", verdict());
        assert!(cache.get("x", "y").is_none());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = ClassificationCache::new(Duration::from_secs(60), 2);
        cache.insert("a", "1", verdict());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("a", "2", verdict());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("a", "3", verdict());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", "1").is_none());
        assert!(cache.get("a", "3").is_some());
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = std::sync::Arc::new(ClassificationCache::new(Duration::from_secs(60), 64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{}-{}", t, i % 10);
                        cache.insert("shared", &id, verdict());
                        let _ = cache.get(&id, "shared");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.len() <= 64);
    }
}
