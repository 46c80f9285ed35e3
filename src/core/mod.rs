//! Core crate types and utilities

pub mod error;
pub mod logging;
pub mod config;
pub mod time;

pub use error::{Error, Result};
pub use config::{LodCacheConfig, LoaderConfig, QualityConfig, QuadTreeConfig};
