//! Configuration for the terrain cache.
//!
//! All structs are serde-serializable so a host can keep them in a JSON file
//! next to its other settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::data::column::CompressionMode;
use crate::math::section_pos::{MAX_DETAIL_LEVEL, MIN_SECTION_WIDTH};

/// Quality curve that maps viewer distance to a detail level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Distance (in blocks) covered by the finest detail level
    pub detail_drop_off_unit: f64,
    /// Logarithm base: each level covers `base` times the distance of the previous one
    pub log_base: f64,
    /// Finest detail level the renderer is allowed to show (0 = full resolution)
    pub max_render_detail_level: u8,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            detail_drop_off_unit: 256.0,
            log_base: 2.0,
            max_render_detail_level: 0,
        }
    }
}

/// Shape of the quadtree region around the viewer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadTreeConfig {
    /// Half width of the square region, in blocks
    pub half_width_blocks: i64,
    /// Detail level of the root nodes (coarsest level in the tree)
    pub root_detail_level: u8,
}

impl Default for QuadTreeConfig {
    fn default() -> Self {
        Self {
            half_width_blocks: 4096,
            root_detail_level: 6,
        }
    }
}

/// Async pipeline settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Worker threads in the bounded pool used for loads and buffer builds
    pub worker_threads: usize,
    /// Timeout for a single data source retrieval
    pub load_timeout_ms: u64,
    /// Timeout for building and uploading one render buffer
    pub build_timeout_ms: u64,
    /// Number of finished data sources kept in the LRU cache
    pub cache_capacity: usize,
    /// Number of idle data sources kept for reuse
    pub max_pooled_sources: usize,
    /// Column compression applied when building sources from raw terrain
    pub compression_mode: CompressionMode,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            load_timeout_ms: 10_000,
            build_timeout_ms: 10_000,
            cache_capacity: 256,
            max_pooled_sources: 64,
            compression_mode: CompressionMode::MergeSameBlocks,
        }
    }
}

impl LoaderConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

/// Top level configuration consumed by [`crate::streaming::LodCache`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodCacheConfig {
    pub quality: QualityConfig,
    pub tree: QuadTreeConfig,
    pub loader: LoaderConfig,
}

impl LodCacheConfig {
    /// Check value ranges that would otherwise surface as odd runtime behavior.
    pub fn validate(&self) -> Result<()> {
        if !(self.quality.log_base > 1.0) {
            return Err(Error::Config(format!(
                "log_base must be > 1.0, got {}",
                self.quality.log_base
            )));
        }
        if !(self.quality.detail_drop_off_unit > 0.0) {
            return Err(Error::Config("detail_drop_off_unit must be positive".into()));
        }
        if self.tree.root_detail_level > MAX_DETAIL_LEVEL {
            return Err(Error::Config(format!(
                "root_detail_level {} exceeds {}",
                self.tree.root_detail_level, MAX_DETAIL_LEVEL
            )));
        }
        if self.quality.max_render_detail_level > self.tree.root_detail_level {
            return Err(Error::Config(
                "max_render_detail_level must not be coarser than the root level".into(),
            ));
        }
        // A child's center is up to width/sqrt(2) further from the viewer than
        // its parent's. Over that distance the curve may climb at most one level.
        for level in 0..self.tree.root_detail_level {
            let band = self.quality.detail_drop_off_unit
                * (self.quality.log_base - 1.0)
                * self.quality.log_base.powi(level as i32 + 1);
            let offset = (MIN_SECTION_WIDTH << level) as f64 / std::f64::consts::SQRT_2;
            if band < offset {
                return Err(Error::Config(format!(
                    "detail curve (unit {}, base {}) is too steep for level {} sections",
                    self.quality.detail_drop_off_unit, self.quality.log_base, level
                )));
            }
        }
        if self.tree.half_width_blocks <= 0 {
            return Err(Error::Config("half_width_blocks must be positive".into()));
        }
        if self.loader.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be at least 1".into()));
        }
        Ok(())
    }

    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
