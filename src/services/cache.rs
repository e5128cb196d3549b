//! Bounded, recency-ordered in-memory cache of payload bytes.
//!
//! Entries hold bytes exactly as stored on disk (still compressed when the
//! object is compressed). The cache never decides what is indexed; callers
//! only insert objects that exist in the index.

use bytes::Bytes;
use dashmap::DashMap;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};
use tracing::info;

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Bytes,
    last_access: Instant,
}

pub struct ObjectCache {
    entries: DashMap<String, CacheEntry>,
    used_bytes: AtomicU64,
    max_bytes: u64,
    max_entries: usize,
}

impl ObjectCache {
    pub fn new(max_bytes: u64, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            used_bytes: AtomicU64::new(0),
            max_bytes,
            max_entries,
        }
    }

    /// Fetch cached bytes and refresh the entry's access time.
    pub fn get(&self, id: &str) -> Option<Bytes> {
        let mut entry = self.entries.get_mut(id)?;
        entry.last_access = Instant::now();
        Some(entry.data.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert unconditionally; the eviction sweep restores the budget.
    pub fn insert(&self, id: &str, data: Bytes) {
        let len = data.len() as u64;
        let previous = self.entries.insert(
            id.to_string(),
            CacheEntry {
                data,
                last_access: Instant::now(),
            },
        );
        self.used_bytes.fetch_add(len, Ordering::SeqCst);
        if let Some(previous) = previous {
            self.used_bytes
                .fetch_sub(previous.data.len() as u64, Ordering::SeqCst);
        }
    }

    /// Insert only when the entry fits inside the memory budget.
    pub fn insert_if_room(&self, id: &str, data: Bytes) -> bool {
        if self.used_bytes() + data.len() as u64 > self.max_bytes {
            return false;
        }
        self.insert(id, data);
        true
    }

    /// Remove an entry, returning the number of bytes released.
    pub fn remove(&self, id: &str) -> Option<u64> {
        let (_, entry) = self.entries.remove(id)?;
        let len = entry.data.len() as u64;
        self.used_bytes.fetch_sub(len, Ordering::SeqCst);
        Some(len)
    }

    /// Apply the eviction policy and return how many entries were dropped.
    ///
    /// Oldest-accessed entries go first until the entry cap holds. When the
    /// memory budget is exceeded at least half of the entries are dropped.
    pub fn evict(&self) -> usize {
        let count = self.entries.len();
        let over_memory = self.used_bytes() > self.max_bytes;
        if count <= self.max_entries && !over_memory {
            return 0;
        }

        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_access))
            .collect();
        by_age.sort_by_key(|(_, last_access)| *last_access);

        let mut to_remove = count.saturating_sub(self.max_entries);
        if over_memory {
            to_remove = to_remove.max(count / 2);
        }

        let mut removed = 0;
        for (id, _) in by_age.into_iter().take(to_remove) {
            if self.remove(&id).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(
                removed,
                used_bytes = self.used_bytes(),
                "Evicted entries from object cache"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}
