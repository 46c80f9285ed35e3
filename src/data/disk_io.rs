//! Full data source serialization and disk I/O
//!
//! Payload layout (big endian):
//!
//! ```text
//! u32 entry_count
//! entry_count x (u16 byte_len, UTF-8 "environment|material")
//! 4096 x (u32 point_count, point_count x u64)
//! ```
//!
//! On disk the payload is wrapped in an rkyv [`DataSourceRecord`] carrying
//! the position key, timestamps and a CRC32 of the column section, and the
//! archive is LZ4 compressed.

use std::path::{Path, PathBuf};

use rkyv::{Archive, Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::core::time::now_millis;
use crate::data::dictionary::FullDataDictionary;
use crate::data::entry_pool::EntryPool;
use crate::data::full_data::{FullDataSource, COLUMN_COUNT};
use crate::math::SectionPos;

/// File extension for persisted data sources
pub const DATA_SOURCE_EXTENSION: &str = "lts";

const FLAG_APPLY_TO_PARENT: u8 = 1;
const FLAG_EMPTY: u8 = 1 << 1;

/// Archived form of one persisted data source
#[derive(Debug, Clone, PartialEq, Archive, Deserialize, Serialize)]
pub struct DataSourceRecord {
    pub key: u64,
    pub created_ms: u64,
    pub last_modified_ms: u64,
    pub flags: u8,
    /// CRC32 of the column section of `payload`
    pub checksum: u32,
    pub payload: Vec<u8>,
}

/// Cursor over a payload that reports short reads as corruption
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                Error::Corrupted(format!(
                    "payload truncated: need {} bytes at offset {}, have {}",
                    len,
                    self.offset,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

/// Serialize a data source to the payload format (uncompressed)
pub fn serialize_data_source(source: &FullDataSource) -> Result<Vec<u8>> {
    let entries = source.dictionary().entries();
    let points = source.point_count();
    let mut out = Vec::with_capacity(4 + entries.len() * 24 + COLUMN_COUNT * 4 + points * 8);

    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in &entries {
        let text = entry.serialize()?;
        let len = u16::try_from(text.len()).map_err(|_| {
            Error::Serialization(format!("dictionary entry too long: {} bytes", text.len()))
        })?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(text.as_bytes());
    }

    for column in source.columns() {
        out.extend_from_slice(&(column.len() as u32).to_be_bytes());
        for point in column {
            out.extend_from_slice(&point.to_be_bytes());
        }
    }
    Ok(out)
}

/// Split a payload into its dictionary and column sections
fn split_sections(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    let mut reader = Reader::new(payload);
    let count = reader.read_u32()?;
    for _ in 0..count {
        let len = reader.read_u16()? as usize;
        reader.take(len)?;
    }
    Ok(payload.split_at(reader.offset))
}

/// CRC32 over the column section of a payload
pub fn checksum(payload: &[u8]) -> Result<u32> {
    let (_, columns) = split_sections(payload)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(columns);
    Ok(hasher.finalize())
}

/// Deserialize a payload into a data source for `pos`
///
/// Entries are interned through `entry_pool` and loaded as-is, duplicates
/// included, so the stored ids stay valid. Every data point is validated
/// against the loaded dictionary.
pub fn deserialize_data_source(
    pos: SectionPos,
    payload: &[u8],
    entry_pool: &EntryPool,
) -> Result<FullDataSource> {
    let (dictionary, columns) = parse_payload(pos, payload, entry_pool)?;
    let now = now_millis();
    FullDataSource::from_parts(pos, dictionary, columns, now, now)
}

fn parse_payload(
    pos: SectionPos,
    payload: &[u8],
    entry_pool: &EntryPool,
) -> Result<(FullDataDictionary, Vec<Vec<u64>>)> {
    let mut reader = Reader::new(payload);

    let entry_count = reader.read_u32()? as usize;
    // Each entry needs at least its length prefix
    if entry_count > reader.remaining() / 2 {
        return Err(Error::Corrupted(format!(
            "{}: entry count {} exceeds payload",
            pos, entry_count
        )));
    }
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let len = reader.read_u16()? as usize;
        let text = std::str::from_utf8(reader.take(len)?)
            .map_err(|e| Error::Corrupted(format!("{}: invalid entry text: {}", pos, e)))?;
        entries.push(entry_pool.intern_serialized(text)?);
    }

    let mut columns = Vec::with_capacity(COLUMN_COUNT);
    for _ in 0..COLUMN_COUNT {
        let count = reader.read_u32()? as usize;
        if count > reader.remaining() / 8 {
            return Err(Error::Corrupted(format!(
                "{}: column length {} exceeds payload",
                pos, count
            )));
        }
        let mut column = Vec::with_capacity(count);
        for _ in 0..count {
            column.push(reader.read_u64()?);
        }
        columns.push(column);
    }
    if reader.remaining() != 0 {
        return Err(Error::Corrupted(format!(
            "{}: {} trailing bytes after columns",
            pos,
            reader.remaining()
        )));
    }

    Ok((FullDataDictionary::from_entries(entries), columns))
}

/// Build the persisted record for a data source
pub fn to_record(source: &FullDataSource) -> Result<DataSourceRecord> {
    let payload = serialize_data_source(source)?;
    let mut flags = 0;
    if source.apply_to_parent() {
        flags |= FLAG_APPLY_TO_PARENT;
    }
    if source.is_empty() {
        flags |= FLAG_EMPTY;
    }
    Ok(DataSourceRecord {
        key: source.pos().to_key(),
        created_ms: source.created_ms(),
        last_modified_ms: source.last_modified_ms(),
        flags,
        checksum: checksum(&payload)?,
        payload,
    })
}

/// Rebuild a data source from a record, verifying key and checksum
pub fn from_record(
    expected: SectionPos,
    record: &DataSourceRecord,
    entry_pool: &EntryPool,
) -> Result<FullDataSource> {
    let pos = SectionPos::from_key(record.key);
    if pos != expected {
        return Err(Error::Corrupted(format!(
            "record for {} found where {} was expected",
            pos, expected
        )));
    }
    let actual = checksum(&record.payload)?;
    if actual != record.checksum {
        return Err(Error::Corrupted(format!(
            "{}: checksum mismatch (stored {:08x}, computed {:08x})",
            pos, record.checksum, actual
        )));
    }

    let (dictionary, columns) = parse_payload(pos, &record.payload, entry_pool)?;
    let mut source = FullDataSource::from_parts(
        pos,
        dictionary,
        columns,
        record.created_ms,
        record.last_modified_ms,
    )?;
    source.set_apply_to_parent(record.flags & FLAG_APPLY_TO_PARENT != 0);
    Ok(source)
}

/// Archive and LZ4 compress a data source
pub fn compress_data_source(source: &FullDataSource) -> Result<Vec<u8>> {
    let record = to_record(source)?;
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&record)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

/// Decompress and unarchive a record
pub fn decompress_record(data: &[u8]) -> Result<DataSourceRecord> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| Error::Corrupted(format!("LZ4 decompression failed: {}", e)))?;

    // The archive needs aligned storage
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(decompressed.len());
    aligned.extend_from_slice(&decompressed);

    let archived = rkyv::access::<ArchivedDataSourceRecord, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Corrupted(e.to_string()))?;
    rkyv::deserialize::<DataSourceRecord, rkyv::rancor::Error>(archived)
        .map_err(|e| Error::Corrupted(e.to_string()))
}

/// Decompress, unarchive and verify a data source
pub fn decompress_data_source(
    expected: SectionPos,
    data: &[u8],
    entry_pool: &EntryPool,
) -> Result<FullDataSource> {
    let record = decompress_record(data)?;
    from_record(expected, &record, entry_pool)
}

/// Get the file path for a data source
pub fn data_source_path(base_dir: &Path, pos: SectionPos) -> PathBuf {
    // One directory per detail level keeps directory sizes bounded
    base_dir
        .join(format!("d{}", pos.detail_level))
        .join(format!("s_{}_{}.{}", pos.x, pos.z, DATA_SOURCE_EXTENSION))
}

/// Save a data source to disk (compressed)
pub async fn save_data_source(base_dir: &Path, source: &FullDataSource) -> Result<()> {
    let path = data_source_path(base_dir, source.pos());
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let compressed = compress_data_source(source)?;
    tokio::fs::write(&path, compressed).await?;
    Ok(())
}

/// Load a data source from disk, if it exists
pub async fn load_data_source(
    base_dir: &Path,
    pos: SectionPos,
    entry_pool: &EntryPool,
) -> Result<Option<FullDataSource>> {
    let path = data_source_path(base_dir, pos);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let compressed = tokio::fs::read(&path).await?;
    decompress_data_source(pos, &compressed, entry_pool).map(Some)
}

/// Delete a data source from disk
pub async fn delete_data_source(base_dir: &Path, pos: SectionPos) -> Result<()> {
    let path = data_source_path(base_dir, pos);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

/// Check if a data source exists on disk
pub async fn data_source_exists(base_dir: &Path, pos: SectionPos) -> bool {
    tokio::fs::try_exists(data_source_path(base_dir, pos))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::data_point;

    fn scenario_source(pool: &EntryPool) -> FullDataSource {
        let mut source = FullDataSource::new(SectionPos::new(2, -3, 7));
        let dict = source.dictionary();
        dict.add_if_not_present_and_get_id(pool.intern("plains", "air"));
        dict.add_if_not_present_and_get_id(pool.intern("plains", "stone"));
        dict.add_if_not_present_and_get_id(pool.intern("forest", "grass"));
        let column = vec![
            data_point::encode(1, 4, 60, 0, 15).unwrap(),
            data_point::encode(0, 60, 0, 0, 15).unwrap(),
        ];
        source.set_column(5, 9, column).unwrap();
        source
    }

    #[test]
    fn test_data_source_path() {
        let base = Path::new("/tmp/lod");
        let path = data_source_path(base, SectionPos::new(3, -4, 12));
        assert_eq!(path, PathBuf::from("/tmp/lod/d3/s_-4_12.lts"));
    }

    #[test]
    fn test_payload_layout() {
        let pool = EntryPool::new();
        let source = scenario_source(&pool);
        let payload = serialize_data_source(&source).unwrap();

        assert_eq!(&payload[0..4], &3u32.to_be_bytes());
        assert_eq!(&payload[4..6], &("plains|air".len() as u16).to_be_bytes());
        assert_eq!(&payload[6..16], b"plains|air");

        let (dict, columns) = split_sections(&payload).unwrap();
        assert_eq!(dict.len(), 4 + 3 * 2 + "plains|air".len() + "plains|stone".len() + "forest|grass".len());
        assert_eq!(columns.len(), COLUMN_COUNT * 4 + 2 * 8);
    }

    #[test]
    fn test_serialize_deserialize_scenario() {
        let pool = EntryPool::new();
        let source = scenario_source(&pool);
        let payload = serialize_data_source(&source).unwrap();

        let loaded = deserialize_data_source(source.pos(), &payload, &pool).unwrap();
        assert_eq!(loaded.dictionary().len(), 3);
        assert_eq!(loaded.column(5, 9), source.column(5, 9));
        assert!(!loaded.is_empty());
        assert_eq!(loaded.dictionary().get_entry(2).unwrap().material(), "grass");
    }

    #[test]
    fn test_deserialize_rejects_truncated() {
        let pool = EntryPool::new();
        let payload = serialize_data_source(&scenario_source(&pool)).unwrap();
        let truncated = &payload[..payload.len() - 3];
        let result = deserialize_data_source(SectionPos::new(2, -3, 7), truncated, &pool);
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_deserialize_rejects_bad_id() {
        let pool = EntryPool::new();
        let mut source = FullDataSource::new(SectionPos::new(0, 0, 0));
        source.dictionary().add_if_not_present_and_get_id(pool.intern("plains", "air"));
        source.set_column(0, 0, vec![data_point::encode(0, 3, 0, 0, 0).unwrap()]).unwrap();
        let mut payload = serialize_data_source(&source).unwrap();

        // Point id lives in the low 32 bits, i.e. the last 4 bytes of the u64
        let (dict, _) = split_sections(&payload).unwrap();
        let id_offset = dict.len() + 4 + 4;
        payload[id_offset..id_offset + 4].copy_from_slice(&7u32.to_be_bytes());

        let result = deserialize_data_source(SectionPos::new(0, 0, 0), &payload, &pool);
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_separator_in_environment_fails_to_serialize() {
        let pool = EntryPool::new();
        let mut source = FullDataSource::new(SectionPos::new(0, 0, 0));
        source.dictionary().add_if_not_present_and_get_id(pool.intern("mod|biome", "stone"));
        let result = serialize_data_source(&source);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_entry_without_separator_is_corrupted() {
        let pool = EntryPool::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&3u16.to_be_bytes());
        payload.extend_from_slice(b"air");
        let result = deserialize_data_source(SectionPos::new(0, 0, 0), &payload, &pool);
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_compress_decompress() {
        let pool = EntryPool::new();
        let mut source = scenario_source(&pool);
        source.set_apply_to_parent(true);

        let compressed = compress_data_source(&source).unwrap();
        let loaded = decompress_data_source(source.pos(), &compressed, &pool).unwrap();
        assert_eq!(loaded.column(5, 9), source.column(5, 9));
        assert_eq!(loaded.created_ms(), source.created_ms());
        assert!(loaded.apply_to_parent());
    }

    #[test]
    fn test_checksum_mismatch() {
        let pool = EntryPool::new();
        let source = scenario_source(&pool);
        let mut record = to_record(&source).unwrap();
        let last = record.payload.len() - 1;
        record.payload[last] ^= 0x01;

        let result = from_record(source.pos(), &record, &pool);
        assert!(matches!(result, Err(Error::Corrupted(ref m)) if m.contains("checksum")));
    }

    #[test]
    fn test_record_for_wrong_position() {
        let pool = EntryPool::new();
        let record = to_record(&scenario_source(&pool)).unwrap();
        assert!(from_record(SectionPos::new(0, 0, 0), &record, &pool).is_err());
    }

    #[test]
    fn test_decompress_garbage() {
        let pool = EntryPool::new();
        let result = decompress_data_source(SectionPos::new(0, 0, 0), &[1, 2, 3], &pool);
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_save_and_load_data_source() {
        let dir = tempfile::tempdir().unwrap();
        let pool = EntryPool::new();
        let source = scenario_source(&pool);

        save_data_source(dir.path(), &source).await.unwrap();
        assert!(data_source_exists(dir.path(), source.pos()).await);

        let loaded = load_data_source(dir.path(), source.pos(), &pool)
            .await
            .unwrap()
            .expect("data source not found");
        assert_eq!(loaded.column(5, 9), source.column(5, 9));

        delete_data_source(dir.path(), source.pos()).await.unwrap();
        assert!(!data_source_exists(dir.path(), source.pos()).await);
    }

    #[tokio::test]
    async fn test_load_missing_data_source() {
        let dir = tempfile::tempdir().unwrap();
        let pool = EntryPool::new();
        let result = load_data_source(dir.path(), SectionPos::new(0, 99, 99), &pool)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
