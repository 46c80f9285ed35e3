//! Shared pool of dictionary entries.
//!
//! Entries are hashed by value into a fixed number of shards; each shard is a
//! hash-bucket map guarded by its own mutex so sections interning in parallel
//! rarely contend.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::data::entry::DictionaryEntry;

const SHARD_COUNT: usize = 16;

type Bucket = Vec<Arc<DictionaryEntry>>;

/// Deduplicates identical (environment, material) pairs system-wide
pub struct EntryPool {
    shards: Vec<Mutex<HashMap<u64, Bucket>>>,
}

impl EntryPool {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Return the pooled entry equal to `(environment, material)`, creating
    /// it on first use.
    pub fn intern(&self, environment: &str, material: &str) -> Arc<DictionaryEntry> {
        let hash = entry_hash(environment, material);
        let mut shard = self.lock_shard(hash);
        let bucket = shard.entry(hash).or_default();

        if let Some(existing) = bucket
            .iter()
            .find(|e| e.environment() == environment && e.material() == material)
        {
            return Arc::clone(existing);
        }

        let entry = Arc::new(DictionaryEntry::new(environment, material));
        bucket.push(Arc::clone(&entry));
        entry
    }

    /// Intern an entry parsed from its serialized form
    pub fn intern_serialized(&self, serialized: &str) -> crate::core::Result<Arc<DictionaryEntry>> {
        let (environment, material) = DictionaryEntry::parse(serialized)?;
        Ok(self.intern(environment, material))
    }

    /// Number of distinct entries in the pool
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| match s.lock() {
                Ok(shard) => shard.values().map(Vec::len).sum::<usize>(),
                Err(poisoned) => poisoned.into_inner().values().map(Vec::len).sum(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries no dictionary references any more
    ///
    /// Returns the number of entries removed.
    pub fn purge_unused(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = match shard.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            shard.retain(|_, bucket| {
                let before = bucket.len();
                bucket.retain(|e| Arc::strong_count(e) > 1);
                removed += before - bucket.len();
                !bucket.is_empty()
            });
        }
        removed
    }

    /// Remove every entry (used at cache shutdown)
    pub fn clear(&self) {
        for shard in &self.shards {
            match shard.lock() {
                Ok(mut s) => s.clear(),
                Err(poisoned) => poisoned.into_inner().clear(),
            }
        }
    }

    fn lock_shard(&self, hash: u64) -> std::sync::MutexGuard<'_, HashMap<u64, Bucket>> {
        let shard = &self.shards[(hash as usize) % SHARD_COUNT];
        match shard.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for EntryPool {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_hash(environment: &str, material: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    environment.hash(&mut hasher);
    material.hash(&mut hasher);
    hasher.finish()
}
