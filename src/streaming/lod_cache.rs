//! Top level terrain LOD cache
//!
//! [`LodCache`] wires the pieces together: it owns the worker runtime, the
//! shared pools and caches, and the quadtree. The host drives it from one
//! thread by calling [`LodCache::tick`] with the viewer position.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use glam::DVec2;
use tokio::runtime::{Handle, Runtime};

use crate::core::config::LodCacheConfig;
use crate::core::error::{Error, Result};
use crate::data::data_point::MAX_Y_RANGE;
use crate::data::{DataSourcePool, EntryPool};
use crate::math::{DetailCurve, SectionPos, MIN_SECTION_WIDTH};
use crate::streaming::cache::DataSourceCache;
use crate::streaming::load_registry::LoadRegistry;
use crate::streaming::provider::{BufferBuilder, DataSourceProvider, LevelContext, RenderBuffer};
use crate::streaming::quadtree::{QuadTree, TickStats};
use crate::streaming::render_section::PipelineContext;

/// How long shutdown waits for worker tasks to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Multi-resolution terrain cache around a moving viewer
///
/// Must be created and dropped outside of any async context, since it owns
/// its own runtime.
pub struct LodCache {
    config: LodCacheConfig,
    level: Arc<dyn LevelContext>,
    entry_pool: Arc<EntryPool>,
    source_pool: Arc<DataSourcePool>,
    cache: Arc<Mutex<DataSourceCache>>,
    ctx: Arc<PipelineContext>,
    // Dropped before the runtime so sections can abort their tasks
    tree: Mutex<QuadTree>,
    runtime: Runtime,
}

impl LodCache {
    /// Build a cache and its worker runtime
    ///
    /// # Arguments
    /// * `config` - Validated before anything is allocated
    /// * `level` - Vertical extent and colors of the source level
    /// * `builder` - Turns data sources into render buffers
    /// * `make_provider` - Creates the data provider from the shared pools
    pub fn init<F>(
        config: LodCacheConfig,
        level: Arc<dyn LevelContext>,
        builder: Arc<dyn BufferBuilder>,
        make_provider: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Arc<EntryPool>, &Arc<DataSourcePool>) -> Arc<dyn DataSourceProvider>,
    {
        config.validate()?;
        if level.height() <= 0 || level.height() > MAX_Y_RANGE {
            return Err(Error::Config(format!(
                "level height {} outside 1..={}",
                level.height(),
                MAX_Y_RANGE
            )));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.loader.worker_threads)
            .thread_name("lodterra-worker")
            .enable_all()
            .build()?;

        let entry_pool = Arc::new(EntryPool::new());
        let source_pool = Arc::new(DataSourcePool::new(config.loader.max_pooled_sources));
        let cache = Arc::new(Mutex::new(DataSourceCache::new(config.loader.cache_capacity)));
        let provider = make_provider(&entry_pool, &source_pool);

        let registry = LoadRegistry::new(
            provider,
            Arc::clone(&cache),
            runtime.handle().clone(),
            config.loader.load_timeout(),
        );
        let ctx = Arc::new(PipelineContext::new(
            Arc::new(registry),
            builder,
            config.loader.build_timeout(),
        ));
        let tree = QuadTree::new(
            &config.tree,
            DetailCurve::new(&config.quality),
            Arc::clone(&ctx),
            (0, 0),
        );

        log::info!(
            "LOD cache ready: {} workers, {} block half width, root detail {}",
            config.loader.worker_threads,
            config.tree.half_width_blocks,
            config.tree.root_detail_level
        );

        Ok(Self {
            config,
            level,
            entry_pool,
            source_pool,
            cache,
            ctx,
            tree: Mutex::new(tree),
            runtime,
        })
    }

    fn tree(&self) -> MutexGuard<'_, QuadTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance one frame for a viewer at `viewer` (block x, block z)
    ///
    /// Recenters the tree on the viewer's minimum-width section first.
    pub fn tick(&self, viewer: DVec2) -> Result<TickStats> {
        let mut tree = self.tree();
        tree.set_center(snap_to_section(viewer));
        tree.tick(viewer)
    }

    /// Move the tree center without ticking
    pub fn set_center(&self, center: (i64, i64)) -> usize {
        self.tree().set_center(center)
    }

    pub fn enabled_sections(&self) -> Vec<SectionPos> {
        self.tree().enabled_sections()
    }

    /// Visit every enabled buffer
    pub fn for_each_visible<F>(&self, mut f: F)
    where
        F: FnMut(SectionPos, &dyn RenderBuffer),
    {
        let tree = self.tree();
        for (pos, buffer) in tree.visible_buffers() {
            f(pos, buffer);
        }
    }

    /// Sections still loading or building
    pub fn uploads_in_flight(&self) -> usize {
        self.tree().uploads_in_flight()
    }

    pub fn node_count(&self) -> usize {
        self.tree().node_count()
    }

    /// Reload the given positions after their stored data changed
    pub fn data_changed(&self, positions: &[SectionPos]) {
        let mut tree = self.tree();
        for &pos in positions {
            tree.reload_position(pos);
        }
    }

    /// Drop interned entries no dictionary uses any more
    pub fn purge_unused_entries(&self) -> usize {
        let purged = self.entry_pool.purge_unused();
        if purged > 0 {
            log::debug!("purged {} unused dictionary entries", purged);
        }
        purged
    }

    /// (hits, misses) of the finished source cache
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).hit_stats()
    }

    pub fn config(&self) -> &LodCacheConfig {
        &self.config
    }

    pub fn level(&self) -> &Arc<dyn LevelContext> {
        &self.level
    }

    pub fn entry_pool(&self) -> &Arc<EntryPool> {
        &self.entry_pool
    }

    pub fn source_pool(&self) -> &Arc<DataSourcePool> {
        &self.source_pool
    }

    pub fn provider(&self) -> &Arc<dyn DataSourceProvider> {
        self.ctx.registry.provider()
    }

    /// Handle to the worker runtime, for driving host side async work
    pub fn runtime_handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Close every section and stop the workers
    pub fn shutdown(self) {
        let LodCache { tree, runtime, cache, .. } = self;
        tree.into_inner().unwrap_or_else(PoisonError::into_inner).clear();
        cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        log::info!("LOD cache shut down");
    }
}

/// Block position of the minimum-width section containing `viewer`
fn snap_to_section(viewer: DVec2) -> (i64, i64) {
    let snap = |v: f64| (v.floor() as i64).div_euclid(MIN_SECTION_WIDTH) * MIN_SECTION_WIDTH;
    (snap(viewer.x), snap(viewer.y))
}
