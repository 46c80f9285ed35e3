//! LRU cache for finished data sources
//!
//! Keeps recently loaded sources in memory so sections that scroll back into
//! view, and neighbours asking for the same position, skip the provider.
//! When the cache is full the least recently used source is evicted.

use std::collections::HashMap;
use std::sync::Arc;

use crate::data::full_data::FullDataSource;
use crate::math::SectionPos;

/// LRU cache of shared data sources
pub struct DataSourceCache {
    /// Map of positions to sources
    sources: HashMap<SectionPos, Arc<FullDataSource>>,
    /// Access order: oldest first, newest last
    access_order: Vec<SectionPos>,
    /// Maximum number of sources to keep
    max_sources: usize,
    hits: u64,
    misses: u64,
}

impl DataSourceCache {
    /// Create a new cache with the given capacity
    ///
    /// # Arguments
    /// * `max_sources` - Maximum number of sources to keep in memory
    pub fn new(max_sources: usize) -> Self {
        Self {
            sources: HashMap::with_capacity(max_sources),
            access_order: Vec::with_capacity(max_sources),
            max_sources,
            hits: 0,
            misses: 0,
        }
    }

    /// Get a source by position
    ///
    /// Updates the access order to mark this source as recently used.
    ///
    /// # Arguments
    /// * `pos` - Section position
    ///
    /// # Returns
    /// Shared handle to the source if it is cached
    pub fn get(&mut self, pos: SectionPos) -> Option<Arc<FullDataSource>> {
        match self.sources.get(&pos) {
            Some(source) => {
                let source = Arc::clone(source);
                self.hits += 1;
                self.update_access_order(pos);
                Some(source)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a source into the cache
    ///
    /// If the cache is at capacity, the least recently used source is evicted first.
    /// A source already cached for the same position is replaced.
    ///
    /// # Returns
    /// The evicted source if one was removed to make space, or the replaced one
    pub fn insert(&mut self, source: Arc<FullDataSource>) -> Option<Arc<FullDataSource>> {
        if self.max_sources == 0 {
            return Some(source);
        }
        let pos = source.pos();

        if self.sources.contains_key(&pos) {
            self.remove_from_access_order(pos);
        }

        let evicted = if self.sources.len() >= self.max_sources && !self.sources.contains_key(&pos) {
            self.evict_oldest()
        } else {
            None
        };

        let replaced = self.sources.insert(pos, source);
        self.access_order.push(pos);

        evicted.or(replaced)
    }

    /// Remove a source from the cache
    pub fn remove(&mut self, pos: SectionPos) -> Option<Arc<FullDataSource>> {
        self.remove_from_access_order(pos);
        self.sources.remove(&pos)
    }

    /// Remove every source matching `predicate`, returning how many were dropped
    pub fn remove_if(&mut self, predicate: impl Fn(SectionPos) -> bool) -> usize {
        let doomed: Vec<SectionPos> = self.sources.keys().copied().filter(|&p| predicate(p)).collect();
        for pos in &doomed {
            self.remove(*pos);
        }
        doomed.len()
    }

    pub fn contains(&self, pos: SectionPos) -> bool {
        self.sources.contains_key(&pos)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_sources
    }

    /// (hits, misses) since creation
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Rough memory held by cached sources
    pub fn estimated_bytes(&self) -> usize {
        self.sources.values().map(|s| s.estimated_bytes()).sum()
    }

    /// Evict the least recently used source
    pub fn evict_oldest(&mut self) -> Option<Arc<FullDataSource>> {
        let pos = self.access_order.first().copied()?;
        self.remove(pos)
    }

    pub fn clear(&mut self) {
        self.sources.clear();
        self.access_order.clear();
    }

    /// Move a position to the end of the access order (most recent)
    fn update_access_order(&mut self, pos: SectionPos) {
        self.remove_from_access_order(pos);
        self.access_order.push(pos);
    }

    fn remove_from_access_order(&mut self, pos: SectionPos) {
        if let Some(i) = self.access_order.iter().position(|&p| p == pos) {
            self.access_order.remove(i);
        }
    }
}
