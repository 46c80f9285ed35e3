//! Quadtree section positions.
//!
//! A `SectionPos` addresses one square section of the world at a detail
//! level. Detail level 0 is the finest section ([`MIN_SECTION_WIDTH`] blocks
//! wide); every level up doubles the width and halves the resolution. The
//! `x`/`z` coordinates are section indices at the position's own level.

use std::fmt;

use glam::DVec2;

/// Width in blocks of a detail level 0 section
pub const MIN_SECTION_WIDTH: i64 = 64;

/// Coarsest detail level that still fits the 28-bit packed coordinates
pub const MAX_DETAIL_LEVEL: u8 = 30;

const COORD_BITS: u32 = 28;
const COORD_MASK: u64 = (1 << COORD_BITS) - 1;
const DETAIL_SHIFT: u32 = 56;

/// Largest coordinate that survives [`SectionPos::to_key`]
pub const MAX_KEY_COORD: i32 = (1 << (COORD_BITS - 1)) - 1;
/// Smallest coordinate that survives [`SectionPos::to_key`]
pub const MIN_KEY_COORD: i32 = -(1 << (COORD_BITS - 1));

/// Horizontal neighbour direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// -Z
    North,
    /// +Z
    South,
    /// +X
    East,
    /// -X
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    /// Unit offset (dx, dz) for this direction
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
        }
    }

    /// Index into `[_; 4]` neighbour arrays, in [`Direction::ALL`] order
    pub fn index(self) -> usize {
        match self {
            Direction::North => 0,
            Direction::South => 1,
            Direction::East => 2,
            Direction::West => 3,
        }
    }
}

/// Position of a section in the quadtree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionPos {
    pub detail_level: u8,
    pub x: i32,
    pub z: i32,
}

impl SectionPos {
    pub fn new(detail_level: u8, x: i32, z: i32) -> Self {
        Self { detail_level, x, z }
    }

    /// Section at `detail_level` that contains the given block position
    pub fn from_block(detail_level: u8, block_x: i64, block_z: i64) -> Self {
        let width = width_at(detail_level);
        Self {
            detail_level,
            x: block_x.div_euclid(width) as i32,
            z: block_z.div_euclid(width) as i32,
        }
    }

    /// Both coordinates fit the packed key
    pub fn is_in_key_range(self) -> bool {
        let range = MIN_KEY_COORD..=MAX_KEY_COORD;
        range.contains(&self.x) && range.contains(&self.z)
    }

    /// Pack into a single integer key
    ///
    /// Layout: detail level in the top 8 bits, then x and z as 28-bit
    /// two's complement values. Coordinates outside
    /// [`MIN_KEY_COORD`]`..=`[`MAX_KEY_COORD`] wrap, see
    /// [`SectionPos::is_in_key_range`].
    pub fn to_key(self) -> u64 {
        ((self.detail_level as u64) << DETAIL_SHIFT)
            | (((self.x as u64) & COORD_MASK) << COORD_BITS)
            | ((self.z as u64) & COORD_MASK)
    }

    /// Inverse of [`SectionPos::to_key`]
    pub fn from_key(key: u64) -> Self {
        let detail_level = (key >> DETAIL_SHIFT) as u8;
        let x = sign_extend((key >> COORD_BITS) & COORD_MASK);
        let z = sign_extend(key & COORD_MASK);
        Self { detail_level, x, z }
    }

    /// Width of this section in blocks
    pub fn width_in_blocks(self) -> i64 {
        width_at(self.detail_level)
    }

    /// Minimum (x, z) block corner
    pub fn min_corner_block(self) -> (i64, i64) {
        let width = self.width_in_blocks();
        (self.x as i64 * width, self.z as i64 * width)
    }

    /// Center of the section in block space
    pub fn center_block(self) -> DVec2 {
        let (min_x, min_z) = self.min_corner_block();
        let half = self.width_in_blocks() as f64 / 2.0;
        DVec2::new(min_x as f64 + half, min_z as f64 + half)
    }

    /// Parent one detail level up
    ///
    /// Returns None at [`MAX_DETAIL_LEVEL`].
    pub fn parent(self) -> Option<Self> {
        if self.detail_level >= MAX_DETAIL_LEVEL {
            return None;
        }
        Some(Self {
            detail_level: self.detail_level + 1,
            x: self.x >> 1,
            z: self.z >> 1,
        })
    }

    /// Child one detail level down
    ///
    /// Index 0-3: bit 0 is the +X half, bit 1 the +Z half. Returns None at
    /// detail level 0, which is the finest supported resolution, and when the
    /// child index would overflow `i32`.
    pub fn child(self, index: usize) -> Option<Self> {
        if self.detail_level == 0 || index > 3 {
            return None;
        }
        Some(Self {
            detail_level: self.detail_level - 1,
            x: self.x.checked_mul(2)?.checked_add((index & 1) as i32)?,
            z: self.z.checked_mul(2)?.checked_add(((index >> 1) & 1) as i32)?,
        })
    }

    /// All four children, or None where [`SectionPos::child`] would be None
    pub fn children(self) -> Option<[Self; 4]> {
        if self.detail_level == 0 {
            return None;
        }
        let d = self.detail_level - 1;
        let (x, z) = (self.x.checked_mul(2)?, self.z.checked_mul(2)?);
        Some([
            Self::new(d, x, z),
            Self::new(d, x + 1, z),
            Self::new(d, x, z + 1),
            Self::new(d, x + 1, z + 1),
        ])
    }

    /// Which child of its parent this position is (0-3)
    pub fn child_index(self) -> usize {
        ((self.x & 1) | ((self.z & 1) << 1)) as usize
    }

    /// Neighbour at the same detail level
    ///
    /// Wraps around at the `i32` limits.
    pub fn adjacent(self, direction: Direction) -> Self {
        let (dx, dz) = direction.offset();
        Self {
            detail_level: self.detail_level,
            x: self.x.wrapping_add(dx),
            z: self.z.wrapping_add(dz),
        }
    }

    /// All four neighbours, in [`Direction::ALL`] order
    pub fn neighbors(self) -> [Self; 4] {
        Direction::ALL.map(|d| self.adjacent(d))
    }

    /// The section at another detail level that overlaps this one's min corner
    pub fn convert_to_detail_level(self, detail_level: u8) -> Self {
        if detail_level >= self.detail_level {
            let shift = (detail_level - self.detail_level) as u32;
            Self {
                detail_level,
                x: self.x >> shift,
                z: self.z >> shift,
            }
        } else {
            let shift = (self.detail_level - detail_level) as u32;
            Self {
                detail_level,
                x: self.x << shift,
                z: self.z << shift,
            }
        }
    }

    /// Whether `other` lies inside (or equals) this section
    pub fn contains(self, other: SectionPos) -> bool {
        other.detail_level <= self.detail_level
            && other.convert_to_detail_level(self.detail_level) == self
    }

    /// Whether the section's square intersects the half-open block square
    /// `[min, max)`.
    pub fn overlaps_block_square(self, min: (i64, i64), max: (i64, i64)) -> bool {
        let (sx, sz) = self.min_corner_block();
        let w = self.width_in_blocks();
        sx < max.0 && sx + w > min.0 && sz < max.1 && sz + w > min.1
    }
}

impl fmt::Display for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{},{}]", self.detail_level, self.x, self.z)
    }
}

fn width_at(detail_level: u8) -> i64 {
    MIN_SECTION_WIDTH << detail_level
}

fn sign_extend(value: u64) -> i32 {
    let shift = 64 - COORD_BITS;
    (((value << shift) as i64) >> shift) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        for pos in [
            SectionPos::new(0, 0, 0),
            SectionPos::new(3, -1, 1),
            SectionPos::new(12, -134_217_728, 134_217_727),
            SectionPos::new(MAX_DETAIL_LEVEL, 5, -9),
        ] {
            assert_eq!(SectionPos::from_key(pos.to_key()), pos, "failed for {}", pos);
        }
    }

    #[test]
    fn test_key_range() {
        let corner = SectionPos::new(5, MAX_KEY_COORD, MIN_KEY_COORD);
        assert!(corner.is_in_key_range());
        assert_eq!(SectionPos::from_key(corner.to_key()), corner);

        let outside = SectionPos::new(5, MAX_KEY_COORD + 1, 0);
        assert!(!outside.is_in_key_range());
        assert_ne!(SectionPos::from_key(outside.to_key()), outside);
    }

    #[test]
    fn test_arithmetic_at_i32_limits() {
        let edge = SectionPos::new(3, i32::MAX, i32::MIN);
        assert_eq!(edge.child(0), None);
        assert_eq!(edge.children(), None);
        assert_eq!(edge.adjacent(Direction::East).x, i32::MIN);
        assert_eq!(edge.adjacent(Direction::North).z, i32::MAX);

        // The last child that still fits
        let near = SectionPos::new(3, (i32::MAX - 1) / 2, 0);
        assert_eq!(near.child(1).map(|c| c.x), Some(i32::MAX));
        assert!(near.children().is_some());
    }

    #[test]
    fn test_keys_are_unique_per_level() {
        let a = SectionPos::new(1, 2, 3);
        let b = SectionPos::new(2, 2, 3);
        assert_ne!(a.to_key(), b.to_key());
    }

    #[test]
    fn test_parent_of_children() {
        for pos in [
            SectionPos::new(1, 0, 0),
            SectionPos::new(4, -3, 7),
            SectionPos::new(6, -1, -1),
        ] {
            let children = pos.children().unwrap();
            for (i, child) in children.iter().enumerate() {
                assert_eq!(child.parent(), Some(pos));
                assert_eq!(pos.child(i), Some(*child));
                assert_eq!(child.child_index(), i);
            }
        }
    }

    #[test]
    fn test_children_tile_parent() {
        let pos = SectionPos::new(3, -2, 5);
        let (px, pz) = pos.min_corner_block();
        let width = pos.width_in_blocks();
        let children = pos.children().unwrap();

        let area: i64 = children.iter().map(|c| c.width_in_blocks().pow(2)).sum();
        assert_eq!(area, width * width);

        for (i, a) in children.iter().enumerate() {
            let (ax, az) = a.min_corner_block();
            assert!(ax >= px && az >= pz);
            assert!(ax + a.width_in_blocks() <= px + width);
            assert!(az + a.width_in_blocks() <= pz + width);
            for b in children.iter().skip(i + 1) {
                let (bx, bz) = b.min_corner_block();
                let w = a.width_in_blocks();
                let overlap = ax < bx + w && bx < ax + w && az < bz + w && bz < az + w;
                assert!(!overlap, "{} overlaps {}", a, b);
            }
        }
    }

    #[test]
    fn test_finest_level_has_no_children() {
        let pos = SectionPos::new(0, 4, 4);
        assert!(pos.children().is_none());
        assert!(pos.child(0).is_none());
    }

    #[test]
    fn test_from_block_negative() {
        assert_eq!(SectionPos::from_block(0, -1, 0), SectionPos::new(0, -1, 0));
        assert_eq!(SectionPos::from_block(0, 63, 64), SectionPos::new(0, 0, 1));
        assert_eq!(SectionPos::from_block(1, -129, 127), SectionPos::new(1, -2, 0));
    }

    #[test]
    fn test_center_block() {
        let pos = SectionPos::new(0, 1, -1);
        assert_eq!(pos.center_block(), DVec2::new(96.0, -32.0));
    }

    #[test]
    fn test_adjacent_and_opposite() {
        let pos = SectionPos::new(2, 0, 0);
        for dir in Direction::ALL {
            assert_eq!(pos.adjacent(dir).adjacent(dir.opposite()), pos);
        }
        assert_eq!(pos.adjacent(Direction::East), SectionPos::new(2, 1, 0));
        assert_eq!(pos.neighbors()[Direction::North.index()], SectionPos::new(2, 0, -1));
    }

    #[test]
    fn test_contains() {
        let pos = SectionPos::new(3, -1, 2);
        assert!(pos.contains(pos));
        for child in pos.children().unwrap() {
            assert!(pos.contains(child));
            assert!(!child.contains(pos));
        }
        assert!(!pos.contains(SectionPos::new(3, 0, 2)));
        assert!(pos.contains(SectionPos::new(0, -1, 16)));
    }

    #[test]
    fn test_convert_to_detail_level() {
        let pos = SectionPos::new(0, -5, 9);
        let up = pos.convert_to_detail_level(2);
        assert_eq!(up, SectionPos::new(2, -2, 2));
        assert_eq!(up.convert_to_detail_level(0), SectionPos::new(0, -8, 8));
    }

    #[test]
    fn test_overlaps_block_square() {
        let pos = SectionPos::new(0, 0, 0);
        assert!(pos.overlaps_block_square((-10, -10), (10, 10)));
        assert!(!pos.overlaps_block_square((64, 0), (128, 64)));
    }
}
