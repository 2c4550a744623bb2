//! Immutable on-disk sorted table (spec §3, §4.5).
//!
//! Grounded on `examples/original_source/libtidesdb.h`'s `SSTable`/
//! `SSTableIterator`: a table is a `Pager`-backed file carrying a cached
//! `(minKey, maxKey)` pair and a forward-only iterator. The teacher's bloom
//! filter + CRC32 checksum (`src/sstable.rs`, `src/storage/block.rs`) are
//! kept as an additive point-lookup optimization layered on top — the
//! table's correctness never depends on them, since a bloom miss only
//! short-circuits a scan that would otherwise find nothing anyway.

use crate::codec::{decode_record, encode_record, Record};
use crate::error::{LsmError, Result};
use crate::pager::Pager;
use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Head-page metadata stored as the SSTable's first Pager record.
#[derive(Serialize, Deserialize)]
struct Header {
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    record_count: usize,
    checksum: u32,
    bloom_bytes: Vec<u8>,
}

/// One immutable, sorted, flushed or compacted table.
pub struct SSTable {
    pager: Pager,
    path: PathBuf,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    record_count: usize,
    bloom: Bloom<[u8]>,
}

impl SSTable {
    /// Writes a brand-new table from `records`, which must already be
    /// sorted ascending by key and non-empty (spec §4.5: callers — flush
    /// and compaction — are the only producers, and both hold a full sorted
    /// run before calling this).
    pub fn create(dir_path: &Path, timestamp: u128, page_size: usize, records: &[Record]) -> Result<Self> {
        if records.is_empty() {
            return Err(LsmError::InvalidArgument(
                "cannot create an SSTable with zero records".to_string(),
            ));
        }

        let path = dir_path.join(format!("{timestamp}.sst"));
        let pager = Pager::open(&path, page_size)?;

        let mut bloom = Bloom::<[u8]>::new_for_fp_rate(records.len(), 0.01)
            .map_err(|e| LsmError::CorruptData(e.to_string()))?;
        let mut checksum_body = Vec::new();
        for record in records {
            bloom.set(record.key.as_slice());
            checksum_body.extend_from_slice(&encode_record(record)?);
        }
        let checksum = crc32fast::hash(&checksum_body);
        let bloom_bytes = bloom.into_bytes();

        let header = Header {
            min_key: records[0].key.clone(),
            max_key: records[records.len() - 1].key.clone(),
            record_count: records.len(),
            checksum,
            bloom_bytes: bloom_bytes.clone(),
        };
        let header_bytes = bincode::serialize(&header)?;
        pager.write(&header_bytes)?;

        for record in records {
            pager.write(&encode_record(record)?)?;
        }

        let bloom = Bloom::<[u8]>::from_bytes(bloom_bytes)
            .map_err(|e| LsmError::CorruptData(e.to_string()))?;

        Ok(Self {
            min_key: header.min_key,
            max_key: header.max_key,
            record_count: header.record_count,
            bloom,
            pager,
            path,
        })
    }

    /// Opens an existing table file, reading just its header page.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let pager = Pager::open(path, page_size)?;
        let mut cursor = pager.cursor();
        let (_, header_bytes) = cursor
            .next()
            .ok_or_else(|| LsmError::CorruptData(format!("{}: empty SSTable file", path.display())))??;
        let header: Header = bincode::deserialize(&header_bytes)?;
        let bloom = Bloom::<[u8]>::from_bytes(header.bloom_bytes)
            .map_err(|e| LsmError::CorruptData(e.to_string()))?;

        Ok(Self {
            min_key: header.min_key,
            max_key: header.max_key,
            record_count: header.record_count,
            bloom,
            pager,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// `true` if `key` could plausibly be in this table, cheaply ruling out
    /// most misses before a scan (spec §4.5's "narrow key range" check).
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return false;
        }
        self.bloom.check(key)
    }

    /// Point lookup via linear scan, gated by the bloom filter and key
    /// range. Malformed records are logged and skipped, never fatal (spec
    /// §4.5).
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        for record in self.iter() {
            let record = record?;
            if record.key == key {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// A forward-only scan over every record in ascending key order,
    /// skipping the header page.
    pub fn iter(&self) -> SSTableIterator<'_> {
        let mut cursor = self.pager.cursor();
        cursor.next(); // discard header
        SSTableIterator { cursor }
    }
}

/// Forward-only cursor over an [`SSTable`]'s records.
pub struct SSTableIterator<'a> {
    cursor: crate::pager::PagerCursor<'a>,
}

impl Iterator for SSTableIterator<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, bytes) = match self.cursor.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            match decode_record(&bytes) {
                Ok(record) => return Some(Ok(record)),
                Err(e) => {
                    warn!("skipping malformed SSTable record: {e}");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(k: &str, v: &str) -> Record {
        Record::new(k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    #[test]
    fn create_then_open_preserves_min_max_and_count() {
        let dir = tempdir().unwrap();
        let records = vec![rec("a", "1"), rec("b", "2"), rec("c", "3")];
        SSTable::create(dir.path(), 1, 256, &records).unwrap();

        let table = SSTable::open(&dir.path().join("1.sst"), 256).unwrap();
        assert_eq!(table.min_key(), b"a");
        assert_eq!(table.max_key(), b"c");
        assert_eq!(table.record_count(), 3);
    }

    #[test]
    fn get_finds_present_key_and_misses_absent_key() {
        let dir = tempdir().unwrap();
        let records = vec![rec("a", "1"), rec("b", "2"), rec("c", "3")];
        let table = SSTable::create(dir.path(), 1, 256, &records).unwrap();

        assert_eq!(table.get(b"b").unwrap().unwrap().value, b"2");
        assert!(table.get(b"z").unwrap().is_none());
        assert!(table.get(b"0").unwrap().is_none()); // outside key range
    }

    #[test]
    fn iter_yields_records_in_written_order() {
        let dir = tempdir().unwrap();
        let records = vec![rec("a", "1"), rec("b", "2"), rec("c", "3")];
        let table = SSTable::create(dir.path(), 1, 256, &records).unwrap();

        let scanned: Vec<Record> = table.iter().map(|r| r.unwrap()).collect();
        assert_eq!(scanned, records);
    }

    #[test]
    fn create_rejects_empty_input() {
        let dir = tempdir().unwrap();
        assert!(SSTable::create(dir.path(), 1, 256, &[]).is_err());
    }

    #[test]
    fn get_preserves_tombstone_values() {
        let dir = tempdir().unwrap();
        let records = vec![Record::new(b"a".to_vec(), crate::codec::TOMBSTONE.to_vec())];
        let table = SSTable::create(dir.path(), 1, 256, &records).unwrap();
        assert!(table.get(b"a").unwrap().unwrap().is_tombstone());
    }
}
