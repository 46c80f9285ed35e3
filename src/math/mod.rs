//! Spatial keys, quadtree position arithmetic and detail selection

pub mod section_pos;
pub mod detail;

pub use section_pos::{Direction, SectionPos, MAX_DETAIL_LEVEL, MAX_KEY_COORD, MIN_KEY_COORD, MIN_SECTION_WIDTH};
pub use detail::{DetailCurve, MAX_CURVE_DETAIL_LEVEL};
