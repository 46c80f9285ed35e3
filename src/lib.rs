//! Lodterra - multi-resolution terrain LOD cache

pub mod core;
pub mod math;
pub mod data;
pub mod streaming;

pub use crate::core::{Error, LodCacheConfig, Result};
pub use crate::math::SectionPos;
pub use crate::streaming::LodCache;
