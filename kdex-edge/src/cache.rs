//! Two-generation render cache
//!
//! Each namespace carries a monotone generation counter. Entries stamped at
//! the current generation are fresh; entries at exactly `current - 1` are
//! stale but servable and drive background re-materialization; anything
//! older is evicted on sight. `clear` invalidates a whole namespace in one
//! atomic bump.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A cache read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub value: String,
    /// False for stale-but-servable entries
    pub is_current: bool,
}

#[derive(Debug)]
struct Entry {
    value: String,
    generation: u64,
}

/// Concurrent two-generation cache keyed by `(namespace, key)`
#[derive(Debug, Default)]
pub struct RenderCache {
    generations: DashMap<String, Arc<AtomicU64>>,
    entries: DashMap<(String, String), Entry>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn generation_counter(&self, ns: &str) -> Arc<AtomicU64> {
        self.generations
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(1)))
            .clone()
    }

    /// Current generation of a namespace
    pub fn generation(&self, ns: &str) -> u64 {
        self.generation_counter(ns).load(Ordering::Acquire)
    }

    /// Read an entry; evicts entries older than one generation
    pub fn get(&self, ns: &str, key: &str) -> Option<CacheHit> {
        let current = self.generation(ns);
        let map_key = (ns.to_string(), key.to_string());

        let hit = match self.entries.get(&map_key) {
            Some(entry) => {
                if entry.generation + 1 < current {
                    None
                } else {
                    Some(CacheHit {
                        value: entry.value.clone(),
                        is_current: entry.generation == current,
                    })
                }
            }
            None => return None,
        };

        if hit.is_none() {
            self.entries.remove(&map_key);
        }
        hit
    }

    /// Write an entry at the namespace's current generation
    pub fn set(&self, ns: &str, key: &str, value: impl Into<String>) {
        let generation = self.generation(ns);
        self.entries.insert(
            (ns.to_string(), key.to_string()),
            Entry {
                value: value.into(),
                generation,
            },
        );
    }

    /// Invalidate every entry in the namespace by bumping its generation;
    /// existing entries become stale-but-servable
    pub fn clear(&self, ns: &str) {
        self.generation_counter(ns).fetch_add(1, Ordering::AcqRel);
    }

    /// Number of live entries, for diagnostics
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get_is_current() {
        let cache = RenderCache::new();
        cache.set("page", "k", "v1");
        let hit = cache.get("page", "k").expect("hit");
        assert_eq!(hit.value, "v1");
        assert!(hit.is_current);
    }

    #[test]
    fn test_clear_makes_entries_stale() {
        let cache = RenderCache::new();
        cache.set("page", "k", "v1");
        cache.clear("page");

        let hit = cache.get("page", "k").expect("stale hit");
        assert_eq!(hit.value, "v1");
        assert!(!hit.is_current);
    }

    #[test]
    fn test_fresh_set_after_clear_is_current() {
        let cache = RenderCache::new();
        cache.set("page", "k", "v1");
        cache.clear("page");
        cache.set("page", "k", "v2");

        let hit = cache.get("page", "k").expect("hit");
        assert_eq!(hit.value, "v2");
        assert!(hit.is_current);
    }

    #[test]
    fn test_two_clears_evict() {
        let cache = RenderCache::new();
        cache.set("page", "k", "v1");
        cache.clear("page");
        cache.clear("page");
        assert!(cache.get("page", "k").is_none());
        // and the slot was actually removed
        assert!(cache.is_empty());
    }

    #[test]
    fn test_namespaces_are_independent() {
        let cache = RenderCache::new();
        cache.set("page", "k", "page-value");
        cache.set("nav", "k", "nav-value");
        cache.clear("page");

        assert!(!cache.get("page", "k").expect("stale").is_current);
        assert!(cache.get("nav", "k").expect("fresh").is_current);
    }

    #[test]
    fn test_generation_is_monotone() {
        let cache = RenderCache::new();
        let g0 = cache.generation("page");
        cache.clear("page");
        let g1 = cache.generation("page");
        cache.clear("page");
        let g2 = cache.generation("page");
        assert!(g0 < g1 && g1 < g2);
    }
}
