//! Disk backed data source provider
//!
//! Serves sources from the compressed files written by [`crate::data::disk_io`].
//! Positions with no file resolve to an empty source and can be queued for
//! generation; the host drains that queue, generates terrain and writes it
//! back with [`FileDataSourceProvider::write_data_source`].

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::error::Result;
use crate::data::disk_io;
use crate::data::full_data::FullDataSource;
use crate::data::{DataSourcePool, EntryPool};
use crate::math::SectionPos;
use crate::streaming::provider::{BoxFuture, DataSourceProvider};

/// Default number of positions that may wait for generation
pub const DEFAULT_MAX_QUEUED: usize = 1024;

#[derive(Default)]
struct RetrievalQueue {
    order: VecDeque<SectionPos>,
    pending: HashSet<SectionPos>,
}

/// Provider reading and writing `.lts` files under a base directory
pub struct FileDataSourceProvider {
    base_dir: PathBuf,
    entry_pool: Arc<EntryPool>,
    source_pool: Arc<DataSourcePool>,
    queue: Mutex<RetrievalQueue>,
    max_queued: usize,
    /// Detail level at which the host generates terrain
    generation_level: u8,
    /// Writes propagate to parents up to this level
    top_detail_level: u8,
}

impl FileDataSourceProvider {
    pub fn new(base_dir: impl Into<PathBuf>, entry_pool: Arc<EntryPool>, source_pool: Arc<DataSourcePool>) -> Self {
        Self {
            base_dir: base_dir.into(),
            entry_pool,
            source_pool,
            queue: Mutex::new(RetrievalQueue::default()),
            max_queued: DEFAULT_MAX_QUEUED,
            generation_level: 0,
            top_detail_level: crate::core::config::QuadTreeConfig::default().root_detail_level,
        }
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }

    pub fn with_generation_level(mut self, level: u8) -> Self {
        self.generation_level = level;
        self
    }

    pub fn with_top_detail_level(mut self, level: u8) -> Self {
        self.top_detail_level = level;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    /// Pop up to `max` queued positions, oldest first
    pub fn take_retrieval_requests(&self, max: usize) -> Vec<SectionPos> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let n = max.min(queue.order.len());
        let taken: Vec<SectionPos> = queue.order.drain(..n).collect();
        for pos in &taken {
            queue.pending.remove(pos);
        }
        taken
    }

    /// Merge `source` into whatever is stored for its position and push the
    /// change up through the parents
    ///
    /// # Returns
    /// Every position whose stored data changed, finest first
    pub async fn write_data_source(&self, source: FullDataSource) -> Result<Vec<SectionPos>> {
        let pos = source.pos();
        let mut current = match disk_io::load_data_source(&self.base_dir, pos, &self.entry_pool).await? {
            Some(mut stored) => {
                let merged = stored.update_from(&source);
                self.source_pool.recycle(source);
                merged?;
                stored
            }
            None => {
                let mut source = source;
                let has_data = !source.is_empty();
                source.set_apply_to_parent(has_data);
                source
            }
        };
        // Whether `current` came from a pool checkout
        let mut pooled = false;
        let mut updated = Vec::new();

        let result = loop {
            let parent_pos = current
                .pos()
                .parent()
                .filter(|p| p.detail_level <= self.top_detail_level);
            let propagate = current.apply_to_parent();
            current.set_apply_to_parent(false);
            if let Err(err) = disk_io::save_data_source(&self.base_dir, &current).await {
                break Err(err);
            }
            updated.push(current.pos());

            let Some(parent_pos) = parent_pos.filter(|_| propagate) else {
                break Ok(());
            };
            let (mut parent, parent_pooled) =
                match disk_io::load_data_source(&self.base_dir, parent_pos, &self.entry_pool).await {
                    Ok(Some(stored)) => (stored, false),
                    Ok(None) => (self.source_pool.checkout(parent_pos), true),
                    Err(err) => break Err(err),
                };
            let changed = parent.update_from_child(&current);
            let previous = std::mem::replace(&mut current, parent);
            self.release(previous, std::mem::replace(&mut pooled, parent_pooled));
            match changed {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.release(current, pooled);
        result?;

        log::debug!("{}: wrote data, {} positions updated", pos, updated.len());
        Ok(updated)
    }

    fn release(&self, source: FullDataSource, pooled: bool) {
        if pooled {
            self.source_pool.give_back(source);
        } else {
            self.source_pool.recycle(source);
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, RetrievalQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DataSourceProvider for FileDataSourceProvider {
    fn get(&self, pos: SectionPos) -> BoxFuture<'static, Result<Arc<FullDataSource>>> {
        let base_dir = self.base_dir.clone();
        let entry_pool = Arc::clone(&self.entry_pool);
        Box::pin(async move {
            // Shared results are never handed back, so empties stay out of the pool
            let source = match disk_io::load_data_source(&base_dir, pos, &entry_pool).await? {
                Some(source) => source,
                None => FullDataSource::new(pos),
            };
            Ok(Arc::new(source))
        })
    }

    fn can_queue_retrieval(&self) -> bool {
        self.lock_queue().order.len() < self.max_queued
    }

    fn queue_position_for_retrieval(&self, pos: SectionPos) -> bool {
        let mut queue = self.lock_queue();
        if queue.order.len() >= self.max_queued || !queue.pending.insert(pos) {
            return false;
        }
        queue.order.push_back(pos);
        true
    }

    /// All positions at the generation level inside `pos`
    fn positions_to_retrieve(&self, pos: SectionPos) -> Vec<SectionPos> {
        if pos.detail_level <= self.generation_level {
            return vec![pos.convert_to_detail_level(self.generation_level)];
        }
        let shift = pos.detail_level - self.generation_level;
        let side = 1i32 << shift;
        let (base_x, base_z) = (pos.x << shift, pos.z << shift);
        let mut positions = Vec::with_capacity((side * side) as usize);
        for dz in 0..side {
            for dx in 0..side {
                positions.push(SectionPos::new(self.generation_level, base_x + dx, base_z + dz));
            }
        }
        positions
    }

    fn remove_retrieval_request_if(&self, predicate: &dyn Fn(SectionPos) -> bool) {
        let mut queue = self.lock_queue();
        let RetrievalQueue { order, pending } = &mut *queue;
        order.retain(|&pos| {
            let remove = predicate(pos);
            if remove {
                pending.remove(&pos);
            }
            !remove
        });
    }
}
