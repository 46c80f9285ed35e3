//! Run-length vertical columns.
//!
//! A column is a list of packed data points ordered top to bottom whose
//! spans never overlap.

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::data::data_point::{self, MAX_Y_RANGE};

/// How aggressively columns are run-length merged
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionMode {
    /// Record every change of material or light
    Uncompressed,
    /// Start a new run only where the material changes on a visible block
    #[default]
    MergeSameBlocks,
}

/// One block of raw terrain as handed over by the world integration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawBlock {
    /// Id in the target section dictionary
    pub id: u32,
    pub block_light: u8,
    pub sky_light: u8,
}

impl RawBlock {
    pub fn new(id: u32, block_light: u8, sky_light: u8) -> Self {
        Self { id, block_light, sky_light }
    }
}

/// A raw column (index 0 = lowest block) plus its horizontal neighbours
pub struct ColumnView<'a> {
    pub blocks: &'a [RawBlock],
    /// Neighbour columns in [`crate::math::Direction::ALL`] order, if loaded
    pub neighbors: [Option<&'a [RawBlock]>; 4],
}

impl<'a> ColumnView<'a> {
    pub fn new(blocks: &'a [RawBlock]) -> Self {
        Self { blocks, neighbors: [None; 4] }
    }

    pub fn with_neighbors(blocks: &'a [RawBlock], neighbors: [Option<&'a [RawBlock]>; 4]) -> Self {
        Self { blocks, neighbors }
    }
}

/// Decides whether a block contributes visible surface
pub trait VisibilityPolicy: Send + Sync {
    fn is_visible(&self, view: &ColumnView<'_>, y: usize) -> bool;
}

/// Every block counts as visible
pub struct AlwaysVisible;

impl VisibilityPolicy for AlwaysVisible {
    fn is_visible(&self, _view: &ColumnView<'_>, _y: usize) -> bool {
        true
    }
}

/// Hides blocks buried inside a single surrounding material
///
/// A block is hidden when the blocks above and below it and the four
/// horizontal neighbours at the same height all share one non-transparent
/// id. Missing neighbour columns count as open, so section edges stay
/// visible.
pub struct SkipEnclosed {
    transparent: Vec<u32>,
}

impl SkipEnclosed {
    pub fn new(transparent_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            transparent: transparent_ids.into_iter().collect(),
        }
    }
}

impl VisibilityPolicy for SkipEnclosed {
    fn is_visible(&self, view: &ColumnView<'_>, y: usize) -> bool {
        let blocks = view.blocks;
        if y == 0 || y + 1 >= blocks.len() {
            return true;
        }
        let enclosing = blocks[y + 1].id;
        if self.transparent.contains(&enclosing) || blocks[y - 1].id != enclosing {
            return true;
        }
        !view.neighbors.iter().all(|n| {
            n.and_then(|col| col.get(y)).is_some_and(|b| b.id == enclosing)
        })
    }
}

#[derive(Clone, Copy)]
struct Run {
    id: u32,
    block_light: u8,
    sky_light: u8,
    top: i32,
    bottom: i32,
}

impl Run {
    fn start(block: RawBlock, y: i32) -> Self {
        Self {
            id: block.id,
            block_light: block.block_light,
            sky_light: block.sky_light,
            top: y + 1,
            bottom: y,
        }
    }

    fn height(&self) -> i32 {
        self.top - self.bottom
    }

    fn encode(&self) -> Result<u64> {
        data_point::encode(self.id, self.height(), self.bottom, self.block_light, self.sky_light)
    }
}

/// Build a packed column from raw blocks, scanning top to bottom
pub fn build_column(
    view: &ColumnView<'_>,
    mode: CompressionMode,
    policy: &dyn VisibilityPolicy,
) -> Result<Vec<u64>> {
    let blocks = view.blocks;
    if blocks.len() > MAX_Y_RANGE as usize {
        return Err(Error::Corrupted(format!(
            "raw column of {} blocks exceeds the vertical range",
            blocks.len()
        )));
    }

    let mut points = Vec::new();
    let mut run: Option<Run> = None;

    for y in (0..blocks.len()).rev() {
        let block = blocks[y];
        let yi = y as i32;
        run = Some(match run {
            None => Run::start(block, yi),
            Some(mut current) => {
                let changed = match mode {
                    CompressionMode::Uncompressed => {
                        block.id != current.id
                            || block.block_light != current.block_light
                            || block.sky_light != current.sky_light
                    }
                    CompressionMode::MergeSameBlocks => {
                        block.id != current.id && policy.is_visible(view, y)
                    }
                };
                if changed || current.height() >= MAX_Y_RANGE - 1 {
                    points.push(current.encode()?);
                    Run::start(block, yi)
                } else {
                    current.bottom = yi;
                    current
                }
            }
        });
    }

    if let Some(last) = run {
        points.push(last.encode()?);
    }
    Ok(points)
}

/// Coalesce adjacent contiguous points with the same id
///
/// Applying it to an already compacted column returns the column unchanged.
pub fn compact_column(points: &[u64]) -> Vec<u64> {
    let mut out: Vec<u64> = Vec::with_capacity(points.len());
    for &point in points {
        if let Some(upper) = out.last_mut() {
            let merged_height = data_point::height(*upper) + data_point::height(point);
            let contiguous =
                data_point::bottom_y(point) + data_point::height(point) == data_point::bottom_y(*upper);
            if data_point::id(*upper) == data_point::id(point)
                && contiguous
                && merged_height < MAX_Y_RANGE
            {
                *upper = data_point::with_span(*upper, data_point::bottom_y(point), merged_height);
                continue;
            }
        }
        out.push(point);
    }
    out
}

/// Check ids against the dictionary size and that spans run top to bottom
/// without overlapping
pub fn validate_column(points: &[u64], dictionary_len: usize) -> Result<()> {
    let mut floor: Option<i32> = None;
    for &value in points {
        let point = data_point::decode(value, dictionary_len)?;
        if let Some(floor) = floor {
            if point.top_y() > floor {
                return Err(Error::Corrupted(format!(
                    "column span {}..{} overlaps the point above (bottom {})",
                    point.bottom_y,
                    point.top_y(),
                    floor
                )));
            }
        }
        floor = Some(point.bottom_y);
    }
    Ok(())
}

/// Rewrite dictionary ids through a remap table
pub fn remap_column_ids(points: &mut [u64], remap: &[u32]) -> Result<()> {
    for point in points.iter_mut() {
        let old = data_point::id(*point);
        let new = *remap.get(old as usize).ok_or_else(|| {
            Error::Corrupted(format!("id {} missing from remap table of {}", old, remap.len()))
        })?;
        *point = data_point::with_id(*point, new);
    }
    Ok(())
}

/// Exclusive top of the highest span, or None for an empty column
pub fn column_top(points: &[u64]) -> Option<i32> {
    points
        .first()
        .map(|&p| data_point::bottom_y(p) + data_point::height(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::data_point::{decode, unpack, DataPoint};

    const AIR: u32 = 0;
    const STONE: u32 = 1;
    const GRASS: u32 = 2;

    fn column(spec: &[(u32, usize)]) -> Vec<RawBlock> {
        // (id, count) bottom to top, full sky light
        spec.iter()
            .flat_map(|&(id, n)| std::iter::repeat(RawBlock::new(id, 0, 15)).take(n))
            .collect()
    }

    #[test]
    fn test_scenario_column() {
        let blocks = column(&[(AIR, 60), (STONE, 4)]);
        let points = build_column(&ColumnView::new(&blocks), CompressionMode::MergeSameBlocks, &AlwaysVisible).unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(decode(points[0], 3).unwrap(), DataPoint::new(STONE, 60, 4, 0, 15));
        assert_eq!(decode(points[1], 3).unwrap(), DataPoint::new(AIR, 0, 60, 0, 15));
    }

    #[test]
    fn test_uncompressed_records_light_changes() {
        let mut blocks = column(&[(STONE, 4)]);
        blocks[1].sky_light = 3;

        let uncompressed =
            build_column(&ColumnView::new(&blocks), CompressionMode::Uncompressed, &AlwaysVisible).unwrap();
        let merged =
            build_column(&ColumnView::new(&blocks), CompressionMode::MergeSameBlocks, &AlwaysVisible).unwrap();

        assert_eq!(uncompressed.len(), 3);
        assert_eq!(merged.len(), 1);
        assert_eq!(unpack(merged[0]).height, 4);
    }

    #[test]
    fn test_buried_blocks_merge_into_run_above() {
        const ORE: u32 = 3;
        let blocks = column(&[(STONE, 3), (ORE, 1), (STONE, 3)]);
        let stone = column(&[(STONE, 7)]);
        let n: &[RawBlock] = &stone;
        let policy = SkipEnclosed::new([AIR]);

        let buried = build_column(
            &ColumnView::with_neighbors(&blocks, [Some(n); 4]),
            CompressionMode::MergeSameBlocks,
            &policy,
        )
        .unwrap();
        assert_eq!(buried.len(), 1);
        assert_eq!(unpack(buried[0]), DataPoint::new(STONE, 0, 7, 0, 15));

        // At a section edge the neighbour is unknown, so the ore stays
        let edge = build_column(
            &ColumnView::with_neighbors(&blocks, [Some(n), Some(n), Some(n), None]),
            CompressionMode::MergeSameBlocks,
            &policy,
        )
        .unwrap();
        let ids: Vec<u32> = edge.iter().map(|&p| data_point::id(p)).collect();
        assert_eq!(ids, vec![STONE, ORE, STONE]);
        validate_column(&edge, 4).unwrap();
    }

    #[test]
    fn test_uncompressed_ignores_visibility() {
        const ORE: u32 = 3;
        let blocks = column(&[(STONE, 3), (ORE, 1), (STONE, 3)]);
        let stone = column(&[(STONE, 7)]);
        let n: &[RawBlock] = &stone;

        let points = build_column(
            &ColumnView::with_neighbors(&blocks, [Some(n); 4]),
            CompressionMode::Uncompressed,
            &SkipEnclosed::new([AIR]),
        )
        .unwrap();
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn test_compaction_is_idempotent() {
        let blocks = column(&[(AIR, 10), (STONE, 5), (STONE, 5), (GRASS, 2)]);
        let raw = build_column(&ColumnView::new(&blocks), CompressionMode::Uncompressed, &AlwaysVisible).unwrap();

        let once = compact_column(&raw);
        let twice = compact_column(&once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn test_compaction_merges_split_runs() {
        let upper = data_point::encode(STONE, 5, 10, 0, 15).unwrap();
        let lower = data_point::encode(STONE, 10, 0, 0, 12).unwrap();
        let compacted = compact_column(&[upper, lower]);

        assert_eq!(compacted.len(), 1);
        let merged = unpack(compacted[0]);
        assert_eq!((merged.bottom_y, merged.height), (0, 15));
        assert_eq!(merged.sky_light, 15);
    }

    #[test]
    fn test_compaction_keeps_gaps() {
        let upper = data_point::encode(STONE, 5, 20, 0, 15).unwrap();
        let lower = data_point::encode(STONE, 10, 0, 0, 15).unwrap();
        assert_eq!(compact_column(&[upper, lower]).len(), 2);
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let upper = data_point::encode(STONE, 5, 10, 0, 15).unwrap();
        let overlapping = data_point::encode(GRASS, 12, 0, 0, 15).unwrap();
        assert!(matches!(validate_column(&[upper, overlapping], 3), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_remap_ids() {
        let mut points = vec![
            data_point::encode(1, 4, 60, 0, 15).unwrap(),
            data_point::encode(0, 60, 0, 0, 15).unwrap(),
        ];
        remap_column_ids(&mut points, &[5, 7]).unwrap();
        assert_eq!(data_point::id(points[0]), 7);
        assert_eq!(data_point::id(points[1]), 5);
        assert!(remap_column_ids(&mut points, &[0]).is_err());
    }

    #[test]
    fn test_column_top() {
        let blocks = column(&[(AIR, 60), (STONE, 4)]);
        let points = build_column(&ColumnView::new(&blocks), CompressionMode::MergeSameBlocks, &AlwaysVisible).unwrap();
        assert_eq!(column_top(&points), Some(64));
        assert_eq!(column_top(&[]), None);
    }

    #[test]
    fn test_oversized_column_rejected() {
        let blocks = vec![RawBlock::default(); MAX_Y_RANGE as usize + 1];
        assert!(build_column(&ColumnView::new(&blocks), CompressionMode::Uncompressed, &AlwaysVisible).is_err());
    }
}
