//! Async loading pipeline and LOD selection

pub mod provider;
pub mod ref_load;
pub mod cache;
pub mod load_registry;
pub mod file_provider;
pub mod render_section;
pub mod quadtree;
pub mod lod_cache;

pub use provider::{
    BoxFuture, BufferBuilder, DataSourceProvider, LevelContext, RenderBuffer, dictionary_colors,
};
pub use ref_load::{LoadLease, RefCountedLoad};
pub use cache::DataSourceCache;
pub use load_registry::{LoadRegistry, SourceLease, SourceLoad};
pub use file_provider::FileDataSourceProvider;
pub use render_section::{PipelineContext, RenderSection, SectionState};
pub use quadtree::{LevelMatch, QuadTree, TickStats, match_level};
pub use lod_cache::LodCache;
