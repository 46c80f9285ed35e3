//! Per-section terrain data: dictionaries, packed data points, columns and
//! full data sources.

pub mod entry;
pub mod entry_pool;
pub mod dictionary;
pub mod data_point;
pub mod column;
pub mod full_data;
pub mod pool;
pub mod disk_io;

pub use entry::DictionaryEntry;
pub use entry_pool::EntryPool;
pub use dictionary::FullDataDictionary;
pub use data_point::DataPoint;
pub use column::{
    AlwaysVisible, ColumnView, CompressionMode, RawBlock, SkipEnclosed, VisibilityPolicy,
    build_column, compact_column, validate_column,
};
pub use full_data::{FullDataSource, COLUMN_COUNT, SECTION_WIDTH};
pub use pool::DataSourcePool;
