//! Packed 64-bit encoding of one vertical run of uniform terrain.
//!
//! Bit layout, least significant first:
//!
//! | bits   | field        |
//! |--------|--------------|
//! | 0-31   | dictionary id|
//! | 32-43  | height       |
//! | 44-55  | bottom y     |
//! | 56-59  | block light  |
//! | 60-63  | sky light    |
//!
//! Y values are relative to the level's minimum build height.

use crate::core::error::{Error, Result};

pub const ID_WIDTH: u32 = 32;
pub const HEIGHT_WIDTH: u32 = 12;
pub const BOTTOM_Y_WIDTH: u32 = 12;
pub const LIGHT_WIDTH: u32 = 4;

const ID_OFFSET: u32 = 0;
const HEIGHT_OFFSET: u32 = ID_OFFSET + ID_WIDTH;
const BOTTOM_Y_OFFSET: u32 = HEIGHT_OFFSET + HEIGHT_WIDTH;
const BLOCK_LIGHT_OFFSET: u32 = BOTTOM_Y_OFFSET + BOTTOM_Y_WIDTH;
const SKY_LIGHT_OFFSET: u32 = BLOCK_LIGHT_OFFSET + LIGHT_WIDTH;

const ID_MASK: u64 = (1 << ID_WIDTH) - 1;
const HEIGHT_MASK: u64 = (1 << HEIGHT_WIDTH) - 1;
const BOTTOM_Y_MASK: u64 = (1 << BOTTOM_Y_WIDTH) - 1;
const LIGHT_MASK: u64 = (1 << LIGHT_WIDTH) - 1;

/// Largest representable vertical extent (relative y range is `0..MAX_Y_RANGE`)
pub const MAX_Y_RANGE: i32 = 1 << HEIGHT_WIDTH;
pub const MAX_LIGHT: u8 = 15;

/// Unpacked data point
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataPoint {
    pub id: u32,
    pub bottom_y: i32,
    pub height: i32,
    pub block_light: u8,
    pub sky_light: u8,
}

impl DataPoint {
    pub fn new(id: u32, bottom_y: i32, height: i32, block_light: u8, sky_light: u8) -> Self {
        Self { id, bottom_y, height, block_light, sky_light }
    }

    /// Exclusive top of the span
    pub fn top_y(&self) -> i32 {
        self.bottom_y + self.height
    }

    pub fn encode(&self) -> Result<u64> {
        encode(self.id, self.height, self.bottom_y, self.block_light, self.sky_light)
    }
}

/// Pack one data point
///
/// Rejects negative or oversized heights and bottoms and light values
/// outside 0-15 instead of clamping them.
pub fn encode(id: u32, height: i32, bottom_y: i32, block_light: u8, sky_light: u8) -> Result<u64> {
    if !(0..MAX_Y_RANGE).contains(&height) {
        return Err(Error::Corrupted(format!("data point height {} out of range", height)));
    }
    if !(0..MAX_Y_RANGE).contains(&bottom_y) {
        return Err(Error::Corrupted(format!("data point bottom y {} out of range", bottom_y)));
    }
    if block_light > MAX_LIGHT || sky_light > MAX_LIGHT {
        return Err(Error::Corrupted(format!(
            "light levels ({}, {}) out of range",
            block_light, sky_light
        )));
    }
    Ok(pack(id, height, bottom_y, block_light, sky_light))
}

/// Unpack and validate a data point against the owning dictionary's size
pub fn decode(value: u64, dictionary_len: usize) -> Result<DataPoint> {
    let point = unpack(value);
    if point.id as usize >= dictionary_len {
        return Err(Error::Corrupted(format!(
            "data point id {} outside dictionary of size {}",
            point.id, dictionary_len
        )));
    }
    if point.top_y() > MAX_Y_RANGE {
        return Err(Error::Corrupted(format!(
            "data point span {}..{} exceeds the vertical range",
            point.bottom_y,
            point.top_y()
        )));
    }
    Ok(point)
}

/// Unpack without validation; only for values already checked by [`decode`]
pub fn unpack(value: u64) -> DataPoint {
    DataPoint {
        id: id(value),
        bottom_y: bottom_y(value),
        height: height(value),
        block_light: block_light(value),
        sky_light: sky_light(value),
    }
}

pub(crate) fn pack(id: u32, height: i32, bottom_y: i32, block_light: u8, sky_light: u8) -> u64 {
    ((id as u64 & ID_MASK) << ID_OFFSET)
        | ((height as u64 & HEIGHT_MASK) << HEIGHT_OFFSET)
        | ((bottom_y as u64 & BOTTOM_Y_MASK) << BOTTOM_Y_OFFSET)
        | ((block_light as u64 & LIGHT_MASK) << BLOCK_LIGHT_OFFSET)
        | ((sky_light as u64 & LIGHT_MASK) << SKY_LIGHT_OFFSET)
}

pub fn id(value: u64) -> u32 {
    ((value >> ID_OFFSET) & ID_MASK) as u32
}

pub fn height(value: u64) -> i32 {
    ((value >> HEIGHT_OFFSET) & HEIGHT_MASK) as i32
}

pub fn bottom_y(value: u64) -> i32 {
    ((value >> BOTTOM_Y_OFFSET) & BOTTOM_Y_MASK) as i32
}

pub fn block_light(value: u64) -> u8 {
    ((value >> BLOCK_LIGHT_OFFSET) & LIGHT_MASK) as u8
}

pub fn sky_light(value: u64) -> u8 {
    ((value >> SKY_LIGHT_OFFSET) & LIGHT_MASK) as u8
}

/// Copy of `value` with a different dictionary id
pub fn with_id(value: u64, id: u32) -> u64 {
    (value & !(ID_MASK << ID_OFFSET)) | ((id as u64 & ID_MASK) << ID_OFFSET)
}

/// Copy of `value` with a different vertical span
pub(crate) fn with_span(value: u64, bottom_y: i32, height: i32) -> u64 {
    pack(id(value), height, bottom_y, block_light(value), sky_light(value))
}
