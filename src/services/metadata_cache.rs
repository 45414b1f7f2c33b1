//! Album metadata cache
//!
//! Album-level year and cover art are fetched once per album search and
//! reused for every track. Entries expire on TTL and the cache is trimmed
//! oldest-first when it outgrows its cap.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::metadata::AlbumMetadata;

pub struct MetadataCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

struct CacheEntry {
    value: AlbumMetadata,
    inserted_at: Instant,
}

impl MetadataCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn get(&self, token: &str) -> Option<AlbumMetadata> {
        let entries = self.entries.read();
        let entry = entries.get(token)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, token: String, value: AlbumMetadata) {
        let mut entries = self.entries.write();
        entries.insert(
            token,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );

        if entries.len() > self.max_entries {
            // Oldest-first trim back to the cap.
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.inserted_at))
                .collect();
            by_age.sort_by_key(|(_, t)| *t);
            let excess = entries.len() - self.max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
    }

    pub fn remove(&self, token: &str) {
        self.entries.write().remove(token);
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
