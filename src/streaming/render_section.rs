//! Render section lifecycle
//!
//! A render section owns one position's path from "needs data" to a GPU
//! ready buffer:
//!
//! ```text
//! Unloaded -> LoadingDataSource -> LoadingNeighbors -> BuildingBuffer -> Ready
//!     ^                                                                   |
//!     +--------------------- failure / stale -----------------------------+
//! ```
//!
//! plus the terminal `Closed`. Corrupted data finishes as `Ready` with an
//! empty result instead of retrying. The async part runs on the worker runtime;
//! the tick thread only calls [`RenderSection::poll`], which never blocks.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::core::error::{Error, Result};
use crate::core::logging::OncePerPosition;
use crate::data::full_data::FullDataSource;
use crate::math::{Direction, SectionPos};
use crate::streaming::load_registry::LoadRegistry;
use crate::streaming::provider::{BufferBuilder, RenderBuffer};

/// Data readiness of a render section
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SectionState {
    Unloaded = 0,
    LoadingDataSource = 1,
    LoadingNeighbors = 2,
    BuildingBuffer = 3,
    Ready = 4,
    Closed = 5,
}

impl SectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SectionState::LoadingDataSource,
            2 => SectionState::LoadingNeighbors,
            3 => SectionState::BuildingBuffer,
            4 => SectionState::Ready,
            5 => SectionState::Closed,
            _ => SectionState::Unloaded,
        }
    }

    /// An upload pipeline is running
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            SectionState::LoadingDataSource | SectionState::LoadingNeighbors | SectionState::BuildingBuffer
        )
    }
}

/// Shared services every render section needs to run its pipeline
pub struct PipelineContext {
    pub registry: Arc<LoadRegistry>,
    pub builder: Arc<dyn BufferBuilder>,
    pub build_timeout: Duration,
    /// Positions that already logged a failure
    pub failures: OncePerPosition,
}

impl PipelineContext {
    pub fn new(registry: Arc<LoadRegistry>, builder: Arc<dyn BufferBuilder>, build_timeout: Duration) -> Self {
        Self {
            registry,
            builder,
            build_timeout,
            failures: OncePerPosition::new(),
        }
    }
}

/// What one finished upload produced
struct UploadOutcome {
    buffer: Option<Box<dyn RenderBuffer>>,
    source_empty: bool,
}

/// Live renderable instance for one section position
pub struct RenderSection {
    pos: SectionPos,
    state: Arc<AtomicU8>,
    rendering_enabled: bool,
    buffer: Option<Box<dyn RenderBuffer>>,
    source_empty: bool,
    /// At least one upload finished since the last failure
    uploaded: bool,
    stale: bool,
    task: Option<JoinHandle<()>>,
    result_rx: Option<oneshot::Receiver<Result<UploadOutcome>>>,
}

impl RenderSection {
    pub fn new(pos: SectionPos) -> Self {
        Self {
            pos,
            state: Arc::new(AtomicU8::new(SectionState::Unloaded as u8)),
            rendering_enabled: false,
            buffer: None,
            source_empty: false,
            uploaded: false,
            stale: false,
            task: None,
            result_rx: None,
        }
    }

    pub fn pos(&self) -> SectionPos {
        self.pos
    }

    pub fn state(&self) -> SectionState {
        SectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_rendering_enabled(&self) -> bool {
        self.rendering_enabled
    }

    pub fn set_rendering_enabled(&mut self, enabled: bool) {
        self.rendering_enabled = enabled && self.state() != SectionState::Closed;
    }

    /// Finished an upload and has nothing newer pending
    pub fn is_loaded(&self) -> bool {
        self.state() == SectionState::Ready && !self.stale
    }

    /// Has a finished upload to show, possibly stale
    pub fn is_drawable(&self) -> bool {
        self.uploaded && self.state() != SectionState::Closed
    }

    pub fn is_in_flight(&self) -> bool {
        self.result_rx.is_some()
    }

    /// Holds a non-empty buffer
    pub fn can_render(&self) -> bool {
        self.buffer.as_ref().is_some_and(|b| !b.is_empty())
    }

    pub fn buffer(&self) -> Option<&dyn RenderBuffer> {
        self.buffer.as_deref()
    }

    /// The last upload found no terrain data for this position
    pub fn source_was_empty(&self) -> bool {
        self.source_empty
    }

    /// Request a fresh upload on the next tick while keeping the current buffer
    pub fn mark_stale(&mut self) {
        if self.state() != SectionState::Closed {
            self.stale = true;
        }
    }

    /// Start the upload pipeline
    ///
    /// No-op while an upload is already in flight or after close. Returns
    /// whether a pipeline was started.
    pub fn start_upload(&mut self, ctx: &PipelineContext) -> bool {
        if self.is_in_flight() || self.state() == SectionState::Closed {
            return false;
        }

        self.stale = false;
        self.state.store(SectionState::LoadingDataSource as u8, Ordering::Release);

        let (tx, rx) = oneshot::channel();
        let pos = self.pos;
        let state = Arc::clone(&self.state);
        let registry = Arc::clone(&ctx.registry);
        let builder = Arc::clone(&ctx.builder);
        let build_timeout = ctx.build_timeout;

        let task = ctx.registry.runtime().spawn(async move {
            let result = run_upload(pos, &state, &registry, builder.as_ref(), build_timeout).await;
            let _ = tx.send(result);
        });

        self.task = Some(task);
        self.result_rx = Some(rx);
        true
    }

    /// Apply a finished upload, if any
    ///
    /// Returns true when the section's renderable state changed.
    pub fn poll(&mut self, ctx: &PipelineContext) -> bool {
        let Some(rx) = self.result_rx.as_mut() else {
            return false;
        };
        let received = match rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return false,
            Err(oneshot::error::TryRecvError::Closed) => Err(Error::Cancelled),
        };
        self.result_rx = None;
        self.task = None;

        if self.state() == SectionState::Closed {
            if let Ok(UploadOutcome { buffer: Some(mut buffer), .. }) = received {
                buffer.release();
            }
            return false;
        }

        match received {
            Ok(outcome) => {
                self.source_empty = outcome.source_empty;
                let new_buffer = match outcome.buffer {
                    Some(mut empty) if empty.is_empty() => {
                        empty.release();
                        None
                    }
                    other => other,
                };
                self.swap_buffer(new_buffer);
                self.uploaded = true;
                self.state.store(SectionState::Ready as u8, Ordering::Release);
                ctx.failures.forget(self.pos);
                true
            }
            Err(err) if err.is_corrupted() => {
                // Corrupted data stands in as an empty source until it is rewritten
                if ctx.failures.first_time(self.pos) {
                    log::error!("{}: corrupted data, rendering nothing: {}", self.pos, err);
                }
                self.swap_buffer(None);
                self.source_empty = true;
                self.uploaded = true;
                self.state.store(SectionState::Ready as u8, Ordering::Release);
                true
            }
            Err(err) => {
                if !err.is_cancelled() && ctx.failures.first_time(self.pos) {
                    log::warn!("{}: upload failed, will retry: {}", self.pos, err);
                }
                self.swap_buffer(None);
                self.uploaded = false;
                self.state.store(SectionState::Unloaded as u8, Ordering::Release);
                true
            }
        }
    }

    fn swap_buffer(&mut self, buffer: Option<Box<dyn RenderBuffer>>) {
        let old = std::mem::replace(&mut self.buffer, buffer);
        if let Some(mut old) = old {
            old.release();
        }
    }

    /// Cancel any in-flight work and release the buffer
    ///
    /// Aborting the task drops its leases, which releases the shared loads
    /// for this position and its neighbours.
    pub fn close(&mut self) {
        if self.state() == SectionState::Closed {
            return;
        }
        self.state.store(SectionState::Closed as u8, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.result_rx = None;
        self.rendering_enabled = false;
        self.uploaded = false;
        self.swap_buffer(None);
    }
}

impl Drop for RenderSection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RenderSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSection")
            .field("pos", &self.pos)
            .field("state", &self.state())
            .field("rendering_enabled", &self.rendering_enabled)
            .field("can_render", &self.can_render())
            .finish()
    }
}

/// Move `state` forward unless the section was closed meanwhile
fn advance(state: &AtomicU8, from: SectionState, to: SectionState) -> Result<()> {
    state
        .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| Error::Cancelled)
}

async fn run_upload(
    pos: SectionPos,
    state: &AtomicU8,
    registry: &LoadRegistry,
    builder: &dyn BufferBuilder,
    build_timeout: Duration,
) -> Result<UploadOutcome> {
    // Lease everything up front so neighbour loads run alongside our own
    let own = registry.acquire(pos);
    let neighbor_leases = Direction::ALL.map(|dir| registry.acquire(pos.adjacent(dir)));

    let source = own.wait().await?;
    advance(state, SectionState::LoadingDataSource, SectionState::LoadingNeighbors)?;

    let mut neighbors: [Option<Arc<FullDataSource>>; 4] = [None, None, None, None];
    for (dir, lease) in Direction::ALL.iter().zip(neighbor_leases.iter()) {
        match lease.wait().await {
            Ok(neighbor) if !neighbor.is_empty() => neighbors[dir.index()] = Some(neighbor),
            Ok(_) => {}
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => log::debug!("{}: neighbour {} unavailable: {}", pos, lease.pos(), err),
        }
    }
    drop(neighbor_leases);

    advance(state, SectionState::LoadingNeighbors, SectionState::BuildingBuffer)?;
    if source.is_empty() {
        return Ok(UploadOutcome { buffer: None, source_empty: true });
    }

    let buffer = tokio::time::timeout(build_timeout, builder.build_and_upload_buffer(source, neighbors))
        .await
        .map_err(|_| Error::Timeout(build_timeout.as_millis() as u64))??;

    Ok(UploadOutcome { buffer: Some(buffer), source_empty: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{data_point, EntryPool};
    use crate::streaming::cache::DataSourceCache;
    use crate::streaming::provider::{BoxFuture, DataSourceProvider};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    /// Positions with x < 0 have no data
    struct TestProvider {
        pool: EntryPool,
        fail_at: Option<(SectionPos, Error)>,
    }

    impl DataSourceProvider for TestProvider {
        fn get(&self, pos: SectionPos) -> BoxFuture<'static, Result<Arc<FullDataSource>>> {
            if let Some((at, err)) = &self.fail_at {
                if *at == pos {
                    let err = err.clone();
                    return Box::pin(async move { Err(err) });
                }
            }
            let mut source = FullDataSource::new(pos);
            if pos.x >= 0 {
                let stone = source
                    .dictionary()
                    .add_if_not_present_and_get_id(self.pool.intern("plains", "stone"));
                let point = data_point::encode(stone, 8, 0, 0, 15);
                if let Ok(point) = point {
                    let _ = source.set_column(1, 1, vec![point]);
                }
            }
            Box::pin(async move { Ok(Arc::new(source)) })
        }

        fn can_queue_retrieval(&self) -> bool {
            true
        }

        fn queue_position_for_retrieval(&self, _pos: SectionPos) -> bool {
            true
        }

        fn positions_to_retrieve(&self, pos: SectionPos) -> Vec<SectionPos> {
            vec![pos]
        }

        fn remove_retrieval_request_if(&self, _predicate: &dyn Fn(SectionPos) -> bool) {}
    }

    struct TestBuffer {
        released: Arc<AtomicBool>,
    }

    impl RenderBuffer for TestBuffer {
        fn is_empty(&self) -> bool {
            false
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct TestBuilder {
        builds: AtomicUsize,
        neighbor_counts: Mutex<Vec<usize>>,
        released: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl BufferBuilder for TestBuilder {
        fn build_and_upload_buffer(
            &self,
            _source: Arc<FullDataSource>,
            neighbors: [Option<Arc<FullDataSource>>; 4],
        ) -> BoxFuture<'static, Result<Box<dyn RenderBuffer>>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.neighbor_counts
                .lock()
                .unwrap()
                .push(neighbors.iter().filter(|n| n.is_some()).count());
            let released = Arc::new(AtomicBool::new(false));
            self.released.lock().unwrap().push(Arc::clone(&released));
            Box::pin(async move { Ok(Box::new(TestBuffer { released }) as Box<dyn RenderBuffer>) })
        }
    }

    fn context(provider: TestProvider, builder: Arc<TestBuilder>) -> PipelineContext {
        let registry = LoadRegistry::new(
            Arc::new(provider),
            Arc::new(Mutex::new(DataSourceCache::new(32))),
            tokio::runtime::Handle::current(),
            Duration::from_secs(5),
        );
        PipelineContext::new(Arc::new(registry), builder, Duration::from_secs(5))
    }

    async fn poll_until_done(section: &mut RenderSection, ctx: &PipelineContext) {
        for _ in 0..500 {
            if section.poll(ctx) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("{} never finished uploading", section.pos());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upload_reaches_ready() {
        let builder = Arc::new(TestBuilder::default());
        let ctx = context(TestProvider { pool: EntryPool::new(), fail_at: None }, Arc::clone(&builder));
        let mut section = RenderSection::new(SectionPos::new(0, 1, 1));

        assert_eq!(section.state(), SectionState::Unloaded);
        assert!(section.start_upload(&ctx));
        // Re-entrant request is ignored
        assert!(!section.start_upload(&ctx));

        poll_until_done(&mut section, &ctx).await;
        assert_eq!(section.state(), SectionState::Ready);
        assert!(section.is_loaded());
        assert!(section.can_render());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        // All four neighbours of (1, 1) have data
        assert_eq!(builder.neighbor_counts.lock().unwrap()[0], 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_source_skips_builder() {
        let builder = Arc::new(TestBuilder::default());
        let ctx = context(TestProvider { pool: EntryPool::new(), fail_at: None }, Arc::clone(&builder));
        let mut section = RenderSection::new(SectionPos::new(0, -5, 0));

        section.start_upload(&ctx);
        poll_until_done(&mut section, &ctx).await;
        assert!(section.is_loaded());
        assert!(section.source_was_empty());
        assert!(!section.can_render());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_returns_to_unloaded() {
        let pos = SectionPos::new(0, 2, 2);
        let builder = Arc::new(TestBuilder::default());
        let offline = Error::Provider("offline".into());
        let ctx = context(TestProvider { pool: EntryPool::new(), fail_at: Some((pos, offline)) }, builder);
        let mut section = RenderSection::new(pos);

        section.start_upload(&ctx);
        poll_until_done(&mut section, &ctx).await;
        assert_eq!(section.state(), SectionState::Unloaded);
        assert!(!section.can_render());
        assert!(!section.is_drawable());
        assert!(!ctx.failures.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_corrupted_source_renders_as_empty() {
        let pos = SectionPos::new(0, 2, 2);
        let builder = Arc::new(TestBuilder::default());
        let corrupted = Error::Corrupted("dictionary id out of range".into());
        let ctx = context(
            TestProvider { pool: EntryPool::new(), fail_at: Some((pos, corrupted)) },
            Arc::clone(&builder),
        );
        let mut section = RenderSection::new(pos);

        section.start_upload(&ctx);
        poll_until_done(&mut section, &ctx).await;
        assert_eq!(section.state(), SectionState::Ready);
        assert!(section.is_loaded());
        assert!(section.is_drawable());
        assert!(section.source_was_empty());
        assert!(!section.can_render());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);

        // A second failure for the same position is not logged again
        section.mark_stale();
        section.start_upload(&ctx);
        poll_until_done(&mut section, &ctx).await;
        assert!(section.is_loaded());
        assert_eq!(ctx.failures.len(), 1);
        assert!(!ctx.failures.first_time(pos));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reupload_releases_old_buffer() {
        let builder = Arc::new(TestBuilder::default());
        let ctx = context(TestProvider { pool: EntryPool::new(), fail_at: None }, Arc::clone(&builder));
        let mut section = RenderSection::new(SectionPos::new(0, 3, 3));

        section.start_upload(&ctx);
        poll_until_done(&mut section, &ctx).await;
        section.mark_stale();
        assert!(!section.is_loaded());
        assert!(section.can_render());

        section.start_upload(&ctx);
        assert!(section.is_drawable());
        poll_until_done(&mut section, &ctx).await;

        let released = builder.released.lock().unwrap();
        assert_eq!(released.len(), 2);
        assert!(released[0].load(Ordering::SeqCst));
        assert!(!released[1].load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_releases_buffer() {
        let builder = Arc::new(TestBuilder::default());
        let ctx = context(TestProvider { pool: EntryPool::new(), fail_at: None }, Arc::clone(&builder));
        let mut section = RenderSection::new(SectionPos::new(0, 4, 4));
        section.start_upload(&ctx);
        poll_until_done(&mut section, &ctx).await;
        section.set_rendering_enabled(true);

        section.close();
        assert_eq!(section.state(), SectionState::Closed);
        assert!(!section.is_rendering_enabled());
        assert!(!section.start_upload(&ctx));
        assert!(builder.released.lock().unwrap()[0].load(Ordering::SeqCst));
    }

    #[test]
    fn test_state_flags() {
        assert!(SectionState::LoadingNeighbors.is_in_flight());
        assert!(!SectionState::Ready.is_in_flight());
        assert_eq!(SectionState::from_u8(SectionState::BuildingBuffer as u8), SectionState::BuildingBuffer);
    }
}
