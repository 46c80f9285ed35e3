//! Reuse of full data source allocations.
//!
//! A source holds 4096 column vectors; recycling them avoids reallocating
//! every time a section scrolls out of view and another one scrolls in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::data::full_data::FullDataSource;
use crate::math::SectionPos;

/// Pool of idle full data sources
pub struct DataSourcePool {
    idle: Mutex<Vec<FullDataSource>>,
    max_pooled: usize,
    checked_out: AtomicUsize,
    reused: AtomicUsize,
}

impl DataSourcePool {
    /// Create a pool that keeps at most `max_pooled` idle sources
    pub fn new(max_pooled: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            checked_out: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    /// Take an empty source for `pos`, reusing an idle one when available
    pub fn checkout(&self, pos: SectionPos) -> FullDataSource {
        self.checked_out.fetch_add(1, Ordering::Relaxed);
        let recycled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match recycled {
            Some(mut source) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                source.reset(pos);
                source
            }
            None => FullDataSource::new(pos),
        }
    }

    /// Return a source obtained from [`DataSourcePool::checkout`]
    ///
    /// Sources beyond the pool capacity are dropped.
    pub fn give_back(&self, source: FullDataSource) {
        let _ = self
            .checked_out
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.recycle(source);
    }

    /// Add a source built outside the pool to the idle list
    ///
    /// Leaves the checkout count alone.
    pub fn recycle(&self, source: FullDataSource) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_pooled {
            idle.push(source);
        }
    }

    /// Sources handed out and not yet returned
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Relaxed)
    }

    /// Number of checkouts served from the idle list
    pub fn reused(&self) -> usize {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop all idle sources
    pub fn clear(&self) {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for DataSourcePool {
    fn default() -> Self {
        Self::new(64)
    }
}
