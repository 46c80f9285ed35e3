//! Distance based detail level selection
//!
//! Each detail level covers `log_base` times the distance of the one below
//! it, starting at `detail_drop_off_unit` blocks for the finest level.

use crate::core::config::QualityConfig;

/// Highest detail level the curve ever returns
///
/// One below the 127 sentinel used for "no detail".
pub const MAX_CURVE_DETAIL_LEVEL: u8 = 126;

/// Quality curve mapping viewer distance to a detail level
#[derive(Clone, Debug, PartialEq)]
pub struct DetailCurve {
    unit: f64,
    log_base_ln: f64,
    max_render_detail_level: u8,
    max_detail_distance: f64,
}

impl DetailCurve {
    pub fn new(config: &QualityConfig) -> Self {
        let unit = config.detail_drop_off_unit;
        let base = config.log_base;
        Self {
            unit,
            log_base_ln: base.ln(),
            max_render_detail_level: config.max_render_detail_level,
            max_detail_distance: unit * base.powi(MAX_CURVE_DETAIL_LEVEL as i32),
        }
    }

    /// Distance beyond which every section gets the coarsest level
    pub fn max_detail_distance(&self) -> f64 {
        self.max_detail_distance
    }

    pub fn max_render_detail_level(&self) -> u8 {
        self.max_render_detail_level
    }

    /// Calculate the detail level for a distance
    ///
    /// # Arguments
    /// * `distance` - Distance in blocks from the viewer
    ///
    /// # Returns
    /// Detail level in `max_render_detail_level..=126`
    pub fn detail_level_for_distance(&self, distance: f64) -> u8 {
        if distance > self.max_detail_distance {
            return MAX_CURVE_DETAIL_LEVEL;
        }
        // ln(0) is -inf, which saturates to i32::MIN and clamps to the finest level
        let raw = ((distance / self.unit).ln() / self.log_base_ln).floor();
        let level = if raw.is_nan() { i32::MIN } else { raw as i32 };
        level.clamp(
            self.max_render_detail_level as i32,
            MAX_CURVE_DETAIL_LEVEL as i32,
        ) as u8
    }

    /// Detail level for a distance, never coarser than `root_level`
    ///
    /// Distance is capped at `max_radius` so sections in the far corners of
    /// the region do not get a level their edge neighbours never reach.
    pub fn detail_level_in_region(&self, distance: f64, max_radius: f64, root_level: u8) -> u8 {
        self.detail_level_for_distance(distance.min(max_radius))
            .min(root_level)
    }
}

impl Default for DetailCurve {
    fn default() -> Self {
        Self::new(&QualityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(unit: f64, base: f64, max_render: u8) -> DetailCurve {
        DetailCurve::new(&QualityConfig {
            detail_drop_off_unit: unit,
            log_base: base,
            max_render_detail_level: max_render,
        })
    }

    #[test]
    fn test_zero_distance_is_max_render_level() {
        assert_eq!(curve(256.0, 2.0, 0).detail_level_for_distance(0.0), 0);
        assert_eq!(curve(256.0, 2.0, 3).detail_level_for_distance(0.0), 3);
    }

    #[test]
    fn test_beyond_max_distance() {
        let c = curve(1.0, 1.01, 0);
        assert_eq!(c.detail_level_for_distance(c.max_detail_distance() * 2.0), 126);
        assert_eq!(c.detail_level_for_distance(f64::INFINITY), 126);
    }

    #[test]
    fn test_progression() {
        let c = curve(256.0, 2.0, 0);
        let cases = [
            (100.0, 0),
            (255.9, 0),
            (256.0, 0),
            (511.9, 0),
            (512.0, 1),
            (1024.0, 2),
            (4096.0, 4),
        ];
        for (distance, expected) in cases {
            assert_eq!(
                c.detail_level_for_distance(distance),
                expected,
                "distance {} should be level {}",
                distance,
                expected
            );
        }
    }

    #[test]
    fn test_monotonic() {
        let c = curve(64.0, 1.5, 0);
        let mut prev = 0;
        for i in 0..2000 {
            let level = c.detail_level_for_distance(i as f64 * 17.0);
            assert!(level >= prev);
            prev = level;
        }
    }

    #[test]
    fn test_region_clamps() {
        let c = curve(256.0, 2.0, 0);
        assert_eq!(c.detail_level_in_region(1.0e9, 1.0e12, 6), 6);
        // Capped radius keeps corners at the edge level
        assert_eq!(c.detail_level_in_region(5000.0, 2048.0, 10), 3);
    }
}
