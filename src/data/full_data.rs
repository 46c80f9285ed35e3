//! Full data sources: one section's grid of columns plus its dictionary.

use rayon::prelude::*;

use crate::core::error::{Error, Result};
use crate::core::time::now_millis;
use crate::data::column::{self, ColumnView, CompressionMode, VisibilityPolicy};
use crate::data::dictionary::FullDataDictionary;
use crate::math::SectionPos;

/// Columns per side of every full data source
pub const SECTION_WIDTH: usize = 64;

/// Columns in one full data source
pub const COLUMN_COUNT: usize = SECTION_WIDTH * SECTION_WIDTH;

/// Section-sized grid of terrain columns
///
/// Columns are indexed `x + z * SECTION_WIDTH`; each column covers
/// `2^detail_level` blocks of its section.
pub struct FullDataSource {
    pos: SectionPos,
    columns: Vec<Vec<u64>>,
    dictionary: FullDataDictionary,
    created_ms: u64,
    last_modified_ms: u64,
    is_empty: bool,
    apply_to_parent: bool,
}

impl FullDataSource {
    /// Create an empty source for a position
    pub fn new(pos: SectionPos) -> Self {
        let now = now_millis();
        Self {
            pos,
            columns: vec![Vec::new(); COLUMN_COUNT],
            dictionary: FullDataDictionary::new(),
            created_ms: now,
            last_modified_ms: now,
            is_empty: true,
            apply_to_parent: false,
        }
    }

    /// Rebuild a source from deserialized parts
    ///
    /// Every column is validated against the dictionary.
    pub fn from_parts(
        pos: SectionPos,
        dictionary: FullDataDictionary,
        columns: Vec<Vec<u64>>,
        created_ms: u64,
        last_modified_ms: u64,
    ) -> Result<Self> {
        if columns.len() != COLUMN_COUNT {
            return Err(Error::Corrupted(format!(
                "{} has {} columns, expected {}",
                pos,
                columns.len(),
                COLUMN_COUNT
            )));
        }
        let dict_len = dictionary.len();
        columns
            .par_iter()
            .try_for_each(|c| column::validate_column(c, dict_len))?;

        let is_empty = columns.iter().all(Vec::is_empty);
        Ok(Self {
            pos,
            columns,
            dictionary,
            created_ms,
            last_modified_ms,
            is_empty,
            apply_to_parent: false,
        })
    }

    /// Clear for reuse at another position, keeping column allocations
    pub fn reset(&mut self, pos: SectionPos) {
        let now = now_millis();
        self.pos = pos;
        for column in &mut self.columns {
            column.clear();
        }
        self.dictionary.clear();
        self.created_ms = now;
        self.last_modified_ms = now;
        self.is_empty = true;
        self.apply_to_parent = false;
    }

    pub fn pos(&self) -> SectionPos {
        self.pos
    }

    pub fn dictionary(&self) -> &FullDataDictionary {
        &self.dictionary
    }

    pub fn columns(&self) -> &[Vec<u64>] {
        &self.columns
    }

    pub fn column(&self, x: usize, z: usize) -> &[u64] {
        &self.columns[column_index(x, z)]
    }

    /// Replace one column after validating it against the dictionary
    pub fn set_column(&mut self, x: usize, z: usize, points: Vec<u64>) -> Result<()> {
        if x >= SECTION_WIDTH || z >= SECTION_WIDTH {
            return Err(Error::Corrupted(format!("column ({}, {}) outside section", x, z)));
        }
        column::validate_column(&points, self.dictionary.len())?;
        if !points.is_empty() {
            self.is_empty = false;
        }
        self.columns[column_index(x, z)] = points;
        self.touch();
        Ok(())
    }

    /// Build a column from raw terrain and store it
    ///
    /// `view.blocks` ids must already come from this source's dictionary.
    pub fn write_raw_column(
        &mut self,
        x: usize,
        z: usize,
        view: &ColumnView<'_>,
        mode: CompressionMode,
        policy: &dyn VisibilityPolicy,
    ) -> Result<()> {
        let points = column::build_column(view, mode, policy)?;
        self.set_column(x, z, points)
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    /// Whether the parent section should be refreshed from this one
    pub fn apply_to_parent(&self) -> bool {
        self.apply_to_parent
    }

    pub fn set_apply_to_parent(&mut self, apply: bool) {
        self.apply_to_parent = apply;
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn last_modified_ms(&self) -> u64 {
        self.last_modified_ms
    }

    /// Total number of data points across all columns
    pub fn point_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    /// Rough heap footprint, used for cache accounting
    pub fn estimated_bytes(&self) -> usize {
        self.point_count() * std::mem::size_of::<u64>()
            + self.columns.len() * std::mem::size_of::<Vec<u64>>()
    }

    /// Check every column against the dictionary
    pub fn validate(&self) -> Result<()> {
        let dict_len = self.dictionary.len();
        self.columns
            .par_iter()
            .try_for_each(|c| column::validate_column(c, dict_len))
    }

    /// Overwrite columns with the non-empty columns of a newer source for the
    /// same position
    ///
    /// Returns whether anything changed.
    pub fn update_from(&mut self, other: &FullDataSource) -> Result<bool> {
        if other.pos != self.pos {
            return Err(Error::InvariantViolation(format!(
                "cannot update {} from {}",
                self.pos, other.pos
            )));
        }
        if other.is_empty {
            return Ok(false);
        }

        let remap = self.dictionary.merge_and_return_remapped_ids(&other.dictionary);
        let remapped: Vec<(usize, Vec<u64>)> = other
            .columns
            .par_iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty())
            .map(|(i, c)| -> Result<(usize, Vec<u64>)> {
                let mut c = c.clone();
                column::remap_column_ids(&mut c, &remap)?;
                Ok((i, c))
            })
            .collect::<Result<_>>()?;

        let changed = !remapped.is_empty();
        for (i, c) in remapped {
            self.columns[i] = c;
        }
        if changed {
            self.is_empty = false;
            self.apply_to_parent = true;
            self.touch();
        }
        Ok(changed)
    }

    /// Downsample a source one detail level finer into the matching quadrant
    ///
    /// Each 2x2 block of child columns collapses to the tallest of the four,
    /// so silhouettes survive at distance.
    pub fn update_from_child(&mut self, child: &FullDataSource) -> Result<bool> {
        if child.pos.parent() != Some(self.pos) {
            return Err(Error::InvariantViolation(format!(
                "{} is not a child of {}",
                child.pos, self.pos
            )));
        }
        if child.is_empty {
            return Ok(false);
        }

        let half = SECTION_WIDTH / 2;
        let quadrant = child.pos.child_index();
        let (offset_x, offset_z) = ((quadrant & 1) * half, (quadrant >> 1) * half);
        let remap = self.dictionary.merge_and_return_remapped_ids(&child.dictionary);

        let downsampled: Vec<(usize, Vec<u64>)> = (0..half * half)
            .into_par_iter()
            .map(|i| -> Result<(usize, Vec<u64>)> {
                let (qx, qz) = (i % half, i / half);
                let tallest = [(0, 0), (1, 0), (0, 1), (1, 1)]
                    .iter()
                    .map(|&(dx, dz)| child.column(qx * 2 + dx, qz * 2 + dz))
                    .max_by_key(|c| column::column_top(c).unwrap_or(i32::MIN))
                    .unwrap_or(&[]);
                let mut points = tallest.to_vec();
                column::remap_column_ids(&mut points, &remap)?;
                Ok((column_index(offset_x + qx, offset_z + qz), points))
            })
            .collect::<Result<_>>()?;

        for (i, points) in downsampled {
            self.columns[i] = points;
        }
        self.is_empty = self.columns.iter().all(Vec::is_empty);
        self.apply_to_parent = true;
        self.touch();
        Ok(true)
    }

    fn touch(&mut self) {
        self.last_modified_ms = now_millis().max(self.last_modified_ms);
    }
}

impl std::fmt::Debug for FullDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullDataSource")
            .field("pos", &self.pos)
            .field("dictionary", &self.dictionary)
            .field("points", &self.point_count())
            .field("is_empty", &self.is_empty)
            .finish()
    }
}

fn column_index(x: usize, z: usize) -> usize {
    x + z * SECTION_WIDTH
}
