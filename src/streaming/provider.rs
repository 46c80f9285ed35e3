//! Collaborator interfaces consumed by the streaming pipeline
//!
//! The cache never talks to a world, a GPU or a database directly. Hosts
//! plug those in through the traits below.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::core::error::Result;
use crate::data::entry::DictionaryEntry;
use crate::data::full_data::FullDataSource;
use crate::math::SectionPos;

/// Boxed, sendable future returned by collaborator traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of full data for section positions
pub trait DataSourceProvider: Send + Sync {
    /// Fetch the data source for `pos`
    ///
    /// Positions with no data yet resolve to an empty source rather than
    /// an error.
    fn get(&self, pos: SectionPos) -> BoxFuture<'static, Result<Arc<FullDataSource>>>;

    /// Whether the provider accepts more out-of-band generation requests
    fn can_queue_retrieval(&self) -> bool;

    /// Ask for `pos` to be generated; returns false if it was not accepted
    fn queue_position_for_retrieval(&self, pos: SectionPos) -> bool;

    /// Positions that must be generated before `pos` can have data
    fn positions_to_retrieve(&self, pos: SectionPos) -> Vec<SectionPos>;

    /// Drop queued retrieval requests matching `predicate`
    fn remove_retrieval_request_if(&self, predicate: &dyn Fn(SectionPos) -> bool);
}

/// GPU-ready geometry for one section
pub trait RenderBuffer: Send + Sync {
    /// True when there is nothing to draw
    fn is_empty(&self) -> bool;

    /// Free the underlying GPU resources
    fn release(&mut self);
}

/// Turns a data source and its neighbours into a render buffer
pub trait BufferBuilder: Send + Sync {
    /// Build and upload the buffer for `source`
    ///
    /// `neighbors` is indexed by [`crate::math::Direction::index`]; missing
    /// or empty neighbours are `None`.
    fn build_and_upload_buffer(
        &self,
        source: Arc<FullDataSource>,
        neighbors: [Option<Arc<FullDataSource>>; 4],
    ) -> BoxFuture<'static, Result<Box<dyn RenderBuffer>>>;
}

/// Properties of the level the terrain comes from
pub trait LevelContext: Send + Sync {
    /// Lowest buildable world y
    fn min_y(&self) -> i32;

    /// Exclusive top of the buildable world
    fn max_y(&self) -> i32;

    fn has_sky_light(&self) -> bool;

    /// Packed RGBA color for an entry at `pos`
    fn compute_base_color(&self, pos: SectionPos, entry: &DictionaryEntry) -> u32;

    /// Vertical extent of the level in blocks
    fn height(&self) -> i32 {
        self.max_y() - self.min_y()
    }
}

/// Base colors for every dictionary id of `source`, indexed by id
///
/// Builders look colors up once per section instead of once per point.
pub fn dictionary_colors(level: &dyn LevelContext, source: &FullDataSource) -> Vec<u32> {
    source
        .dictionary()
        .entries()
        .iter()
        .map(|entry| level.compute_base_color(source.pos(), entry))
        .collect()
}
