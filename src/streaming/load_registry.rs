//! Deduplication of in-flight data source loads
//!
//! Every request for a position goes through the registry, which hands out
//! a lease on the single live load for that position, creating one only when
//! none can be shared. Finished sources land in the LRU cache unless their
//! position was invalidated while they ran.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::core::error::Error;
use crate::data::full_data::FullDataSource;
use crate::math::SectionPos;
use crate::streaming::cache::DataSourceCache;
use crate::streaming::provider::DataSourceProvider;
use crate::streaming::ref_load::{LoadLease, RefCountedLoad};

pub type SourceLoad = RefCountedLoad<Arc<FullDataSource>>;
pub type SourceLease = LoadLease<Arc<FullDataSource>>;

/// Registry of shared loads keyed by position
pub struct LoadRegistry {
    loads: Mutex<HashMap<SectionPos, Arc<SourceLoad>>>,
    provider: Arc<dyn DataSourceProvider>,
    cache: Arc<Mutex<DataSourceCache>>,
    /// Bumped by `invalidate`; a load only caches if its generation is current
    generations: Arc<Mutex<HashMap<SectionPos, u64>>>,
    runtime: Handle,
    load_timeout: Duration,
}

impl LoadRegistry {
    pub fn new(
        provider: Arc<dyn DataSourceProvider>,
        cache: Arc<Mutex<DataSourceCache>>,
        runtime: Handle,
        load_timeout: Duration,
    ) -> Self {
        Self {
            loads: Mutex::new(HashMap::new()),
            provider,
            cache,
            generations: Arc::new(Mutex::new(HashMap::new())),
            runtime,
            load_timeout,
        }
    }

    /// Get a lease on the load for `pos`
    ///
    /// Reuses a live load when possible, then the cache, and only then asks
    /// the provider.
    pub fn acquire(&self, pos: SectionPos) -> SourceLease {
        let mut loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(lease) = loads.get(&pos).and_then(LoadLease::acquire) {
            return lease;
        }

        let cached = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(pos);
        let load = match cached {
            Some(source) => RefCountedLoad::completed(pos, source),
            None => self.spawn_load(pos),
        };
        loads.insert(pos, Arc::clone(&load));
        LoadLease::adopt(load)
    }

    fn spawn_load(&self, pos: SectionPos) -> Arc<SourceLoad> {
        let fetch = self.provider.get(pos);
        let cache = Arc::clone(&self.cache);
        let generations = Arc::clone(&self.generations);
        let generation = generation_of(&generations, pos);
        let timeout = self.load_timeout;

        RefCountedLoad::spawn(&self.runtime, pos, async move {
            let source = tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| Error::Timeout(timeout.as_millis() as u64))??;
            if source.pos() != pos {
                return Err(Error::Provider(format!(
                    "provider returned {} for {}",
                    source.pos(),
                    pos
                )));
            }
            // Empty sources are expected to be filled in later
            if !source.is_empty() {
                let generations = generations.lock().unwrap_or_else(PoisonError::into_inner);
                if generations.get(&pos).copied().unwrap_or(0) == generation {
                    cache
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(Arc::clone(&source));
                } else {
                    log::trace!("{}: invalidated while loading, not caching", pos);
                }
            }
            Ok(source)
        })
    }

    /// Drop registry entries that are finished or no longer referenced
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self) -> usize {
        let mut loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);
        let before = loads.len();
        loads.retain(|_, load| !(load.is_done() || load.is_cancelled() || load.is_abandoned()));
        before - loads.len()
    }

    /// Forget any cached or loading data for `pos` so the next request
    /// goes back to the provider
    ///
    /// A load already running keeps serving its current leases but is no
    /// longer shared and does not reach the cache.
    pub fn invalidate(&self, pos: SectionPos) {
        {
            let mut generations = self.generations.lock().unwrap_or_else(PoisonError::into_inner);
            *generations.entry(pos).or_insert(0) += 1;
            self.cache.lock().unwrap_or_else(PoisonError::into_inner).remove(pos);
        }
        self.loads.lock().unwrap_or_else(PoisonError::into_inner).remove(&pos);
    }

    /// Number of loads currently tracked
    pub fn in_flight(&self) -> usize {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|load| !load.is_done() && !load.is_cancelled())
            .count()
    }

    pub fn provider(&self) -> &Arc<dyn DataSourceProvider> {
        &self.provider
    }

    pub fn cache(&self) -> &Arc<Mutex<DataSourceCache>> {
        &self.cache
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }
}

fn generation_of(generations: &Mutex<HashMap<SectionPos, u64>>, pos: SectionPos) -> u64 {
    generations
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&pos)
        .copied()
        .unwrap_or(0)
}
