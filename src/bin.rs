//! Fixed-size bin records stored after the header block, one per grid cell.

use std::io;

use crate::bitpack::Field;
use crate::error::Result;
use crate::geometry::{BinIndex, Coord, Grid};
use crate::header::{BinHeader, BinLayout, RangeStats, HEADER_SIZE};
use crate::io::Backend;
use crate::validity::Validity;
use crate::Error;

/// Coverage map flags, one byte per bin.
pub const COVERAGE_SURVEYED: u8 = 1 << 0;
pub const COVERAGE_GAP: u8 = 1 << 1;
pub const COVERAGE_CHECKED: u8 = 1 << 2;
pub const COVERAGE_VERIFIED: u8 = 1 << 3;
pub const COVERAGE_HAS_DATA: u8 = 1 << 4;

/// Aggregate statistics for one bin plus the ends of its depth chain.
#[derive(Debug, Clone, PartialEq)]
pub struct BinRecord {
    pub index: BinIndex,
    pub center: Coord,
    /// Physical records in the chain, deleted ones included.
    pub num_soundings: u64,
    pub count: u32,
    pub valid_count: u32,
    pub standard_dev: f64,
    pub avg_filtered_depth: f64,
    pub min_filtered_depth: f64,
    pub max_filtered_depth: f64,
    pub avg_depth: f64,
    pub min_depth: f64,
    pub max_depth: f64,
    pub attributes: Vec<f64>,
    pub validity: Validity,
    pub head: u64,
    pub tail: u64,
}

impl BinRecord {
    pub fn has_chain(&self) -> bool {
        self.head != 0
    }
}

#[derive(Debug)]
pub struct BinStore {
    file: Box<dyn Backend>,
    layout: BinLayout,
    grid: Grid,
    null_depth: f64,
    coverage_offset: Option<u64>,
}

impl BinStore {
    /// Writes the header block followed by an empty record for every cell.
    pub fn create(mut file: Box<dyn Backend>, header: &BinHeader) -> Result<Self> {
        header.write(file.as_mut())?;
        let mut store = Self::new(file, header);

        let record_size = store.layout.record_size;
        let mut row_buf = vec![0u8; record_size * header.grid.width as usize];
        for row in 0..header.grid.height {
            for col in 0..header.grid.width {
                let index = BinIndex::new(row, col);
                let empty = store.empty(index)?;
                let start = col as usize * record_size;
                store.encode_into(&empty, &mut row_buf[start..start + record_size])?;
            }
            let offset = store.offset(BinIndex::new(row, 0));
            store
                .file
                .write_at(offset, &row_buf)
                .map_err(|source| Error::BinWrite { row, col: 0, source })?;
        }
        if let Some(offset) = store.coverage_offset {
            let zeros = vec![0u8; header.grid.width as usize];
            for row in 0..header.grid.height {
                let at = offset + row as u64 * header.grid.width as u64;
                store.file.write_at(at, &zeros)?;
            }
        }
        store.file.sync()?;
        Ok(store)
    }

    /// Opens the records of an existing bin file whose header has already been read.
    pub fn open(file: Box<dyn Backend>, header: &BinHeader) -> Result<Self> {
        let len = file.len()?;
        if len < header.bin_file_len() {
            return Err(Error::InvalidHeader(format!(
                "bin file holds {} bytes but {}x{} bins need {}",
                len,
                header.grid.width,
                header.grid.height,
                header.bin_file_len()
            )));
        }
        Ok(Self::new(file, header))
    }

    fn new(file: Box<dyn Backend>, header: &BinHeader) -> Self {
        let layout = header.bin_layout();
        // Null depth as it reads back from a depth field.
        let null_depth = layout
            .min
            .encode(header.null_depth)
            .map(|raw| layout.min.decode(raw))
            .unwrap_or(header.null_depth);
        Self {
            file,
            layout,
            grid: header.grid,
            null_depth,
            coverage_offset: header.coverage_map.then(|| header.coverage_offset()),
        }
    }

    pub fn layout(&self) -> &BinLayout {
        &self.layout
    }

    /// A record for a bin with no soundings.
    pub fn empty(&self, index: BinIndex) -> Result<BinRecord> {
        let null = self.null_depth;
        Ok(BinRecord {
            index,
            center: self.grid.center(index)?,
            num_soundings: 0,
            count: 0,
            valid_count: 0,
            standard_dev: 0.0,
            avg_filtered_depth: null,
            min_filtered_depth: null,
            max_filtered_depth: null,
            avg_depth: null,
            min_depth: null,
            max_depth: null,
            attributes: self.layout.attributes.iter().map(|a| a.absent).collect(),
            validity: Validity::NONE,
            head: 0,
            tail: 0,
        })
    }

    fn offset(&self, index: BinIndex) -> u64 {
        HEADER_SIZE as u64 + self.grid.linear(index) * self.layout.record_size as u64
    }

    fn read_raw(&mut self, index: BinIndex, len: usize) -> Result<Vec<u8>> {
        self.grid.check(index)?;
        let offset = self.offset(index);
        let mut buf = vec![0u8; len];
        self.file
            .read_at(offset, &mut buf)
            .map_err(|source| Error::BinRead {
                row: index.row,
                col: index.col,
                source,
            })?;
        Ok(buf)
    }

    pub fn read(&mut self, index: BinIndex) -> Result<BinRecord> {
        let buf = self.read_raw(index, self.layout.record_size)?;
        self.decode(index, &buf)
    }

    fn decode(&self, index: BinIndex, buf: &[u8]) -> Result<BinRecord> {
        let l = &self.layout;
        let count = |f: &Field| f.read(buf) as u32;
        Ok(BinRecord {
            index,
            center: self.grid.center(index)?,
            num_soundings: l.num_soundings.read(buf),
            count: count(&l.count),
            valid_count: count(&l.valid_count),
            standard_dev: l.std.read(buf),
            avg_filtered_depth: l.avg_filtered.read(buf),
            min_filtered_depth: l.min_filtered.read(buf),
            max_filtered_depth: l.max_filtered.read(buf),
            avg_depth: l.avg.read(buf),
            min_depth: l.min.read(buf),
            max_depth: l.max.read(buf),
            attributes: l.attributes.iter().map(|a| a.read(buf)).collect(),
            validity: Validity::from_bits(l.validity.read(buf) as u32),
            head: l.head.read(buf),
            tail: l.tail.read(buf),
        })
    }

    pub fn read_by_coord(&mut self, coord: Coord) -> Result<BinRecord> {
        let index = self.grid.index(coord)?;
        self.read(index)
    }

    /// Reads only the bytes up to the end of the validity field.
    pub fn read_validity(&mut self, index: BinIndex) -> Result<Validity> {
        let len = self.layout.validity.end().div_ceil(8);
        let buf = self.read_raw(index, len)?;
        Ok(Validity::from_bits(self.layout.validity.read(&buf) as u32))
    }

    fn check_record(&self, record: &BinRecord) -> Result<()> {
        let index = record.index;
        self.grid.check(index)?;
        if record.attributes.len() != self.layout.attributes.len() {
            return Err(Error::InvalidOperation(format!(
                "bin ({}, {}) carries {} attributes, header defines {}",
                index.row,
                index.col,
                record.attributes.len(),
                self.layout.attributes.len()
            )));
        }
        Ok(())
    }

    fn encode_into(&self, record: &BinRecord, buf: &mut [u8]) -> Result<()> {
        let l = &self.layout;
        l.num_soundings.write(buf, record.num_soundings)?;
        l.count.write(buf, record.count as u64)?;
        l.valid_count.write(buf, record.valid_count as u64)?;
        l.std.write(buf, record.standard_dev)?;
        l.avg_filtered.write(buf, record.avg_filtered_depth)?;
        l.min_filtered.write(buf, record.min_filtered_depth)?;
        l.max_filtered.write(buf, record.max_filtered_depth)?;
        l.avg.write(buf, record.avg_depth)?;
        l.min.write(buf, record.min_depth)?;
        l.max.write(buf, record.max_depth)?;
        for (field, value) in l.attributes.iter().zip(&record.attributes) {
            field.write(buf, *value)?;
        }
        l.validity.write(buf, record.validity.bits() as u64)?;
        l.head.write(buf, record.head)?;
        l.tail.write(buf, record.tail)?;
        Ok(())
    }

    /// Writes `record` and folds its aggregates into the in-memory header ranges.
    ///
    /// The header itself is not rewritten; callers persist it when they choose.
    pub fn write(&mut self, stats: &mut RangeStats, record: &BinRecord) -> Result<()> {
        let index = record.index;
        self.check_record(record)?;

        let mut buf = vec![0u8; self.layout.record_size];
        self.encode_into(record, &mut buf)?;
        let stored = self.decode(index, &buf)?;
        let offset = self.offset(index);
        self.file
            .write_at(offset, &buf)
            .map_err(|source| Error::BinWrite {
                row: index.row,
                col: index.col,
                source,
            })?;

        // Counts run ahead of the aggregates until the bin is recomputed.
        if stored.valid_count > 0 && stored.min_filtered_depth != self.null_depth {
            stats.observe_filtered(stored.min_filtered_depth, stored.max_filtered_depth, index);
            stats.observe_standard_dev(stored.standard_dev);
        }
        if stored.count > 0 && stored.min_depth != self.null_depth {
            stats.observe_unfiltered(stored.min_depth, stored.max_depth, index);
            stats.observe_count(stored.count, index);
        }
        Ok(())
    }

    /// `record` as a read after writing it would return it, at field precision.
    pub fn normalize(&self, record: &BinRecord) -> Result<BinRecord> {
        self.check_record(record)?;
        let mut buf = vec![0u8; self.layout.record_size];
        self.encode_into(record, &mut buf)?;
        self.decode(record.index, &buf)
    }

    fn coverage_at(&self, index: BinIndex) -> Result<u64> {
        self.grid.check(index)?;
        let offset = self.coverage_offset.ok_or_else(|| {
            Error::InvalidOperation("structure has no coverage map".into())
        })?;
        Ok(offset + self.grid.linear(index))
    }

    pub fn read_coverage(&mut self, index: BinIndex) -> Result<u8> {
        let at = self.coverage_at(index)?;
        let mut byte = [0u8; 1];
        self.file.read_at(at, &mut byte)?;
        Ok(byte[0])
    }

    pub fn write_coverage(&mut self, index: BinIndex, flags: u8) -> Result<()> {
        let at = self.coverage_at(index)?;
        self.file.write_at(at, &[flags])?;
        Ok(())
    }

    pub fn write_header(&mut self, header: &BinHeader) -> Result<()> {
        header.write(self.file.as_mut())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync()
    }

    pub fn commit(&mut self) -> io::Result<()> {
        self.file.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Mbr;
    use crate::header::HeaderConfig;
    use crate::io::{IoKind, OpenMode, DEFAULT_SEGMENT_SIZE};
    use tempfile::tempdir;

    fn setup(path: &std::path::Path, config: &HeaderConfig) -> Result<(BinHeader, BinStore)> {
        let header = BinHeader::new(config)?;
        let file = IoKind::Large.open(path, OpenMode::Create, DEFAULT_SEGMENT_SIZE)?;
        let store = BinStore::create(file, &header)?;
        Ok((header, store))
    }

    fn config() -> HeaderConfig {
        HeaderConfig::new(Mbr::new(0.0, 0.0, 10.0, 10.0), 1.0).depth_range(-10.0, 100.0, 100.0)
    }

    #[test]
    fn test_new_bins_are_empty() -> Result<()> {
        let dir = tempdir()?;
        let (header, mut store) = setup(&dir.path().join("a.bin"), &config())?;

        let record = store.read(BinIndex::new(9, 9))?;
        assert_eq!(record.count, 0);
        assert_eq!(record.avg_depth, header.null_depth);
        assert_eq!(record.head, 0);
        assert_eq!(record.center, Coord::new(9.5, 9.5));
        Ok(())
    }

    #[test]
    fn test_write_read_and_stats() -> Result<()> {
        let dir = tempdir()?;
        let (mut header, mut store) = setup(&dir.path().join("b.bin"), &config())?;

        let index = BinIndex::new(2, 3);
        let mut record = store.empty(index)?;
        record.num_soundings = 4;
        record.count = 4;
        record.valid_count = 3;
        record.standard_dev = 0.25;
        record.avg_filtered_depth = 12.5;
        record.min_filtered_depth = 12.0;
        record.max_filtered_depth = 13.0;
        record.avg_depth = 12.75;
        record.min_depth = 11.5;
        record.max_depth = 14.0;
        record.validity = Validity::DATA | Validity::CHECKED;
        record.head = 7;
        record.tail = 9;
        store.write(&mut header.stats, &record)?;

        assert_eq!(store.read(index)?, record);
        assert_eq!(store.read_validity(index)?, record.validity);
        assert_eq!(store.read_by_coord(Coord::new(3.2, 2.9))?, record);

        let min = header.stats.min_depth.unwrap();
        assert_eq!((min.value, min.at), (11.5, index));
        assert_eq!(header.stats.max_bin_count.unwrap().value, 4);
        Ok(())
    }

    #[test]
    fn test_stats_follow_stored_precision() -> Result<()> {
        let dir = tempdir()?;
        let (mut header, mut store) = setup(&dir.path().join("p.bin"), &config())?;

        let index = BinIndex::new(1, 1);
        let mut record = store.empty(index)?;
        record.num_soundings = 2;
        record.count = 2;
        // Appended but not recomputed yet: no range to observe.
        store.write(&mut header.stats, &record)?;
        assert_eq!(header.stats.min_depth, None);

        record.min_depth = 1.004;
        record.max_depth = 1.0171;
        record.avg_depth = 1.0105;
        let stored = store.normalize(&record)?;
        assert_ne!(stored, record);
        store.write(&mut header.stats, &record)?;
        assert_eq!(store.read(index)?, stored);
        assert_eq!(header.stats.min_depth.unwrap().value, stored.min_depth);
        assert_eq!(header.stats.max_depth.unwrap().value, stored.max_depth);
        assert_eq!(store.normalize(&stored)?, stored);
        Ok(())
    }

    #[test]
    fn test_out_of_range_values_rejected() -> Result<()> {
        let dir = tempdir()?;
        let (mut header, mut store) = setup(&dir.path().join("c.bin"), &config())?;

        let mut record = store.empty(BinIndex::new(0, 0))?;
        record.count = 1;
        record.min_depth = 500.0;
        assert!(matches!(
            store.write(&mut header.stats, &record),
            Err(Error::Overflow { .. })
        ));
        assert!(matches!(
            store.read(BinIndex::new(10, 0)),
            Err(Error::OutOfBounds { row: 10, col: 0 })
        ));
        Ok(())
    }

    #[test]
    fn test_coverage_map() -> Result<()> {
        let dir = tempdir()?;
        let (header, mut store) =
            setup(&dir.path().join("d.bin"), &config().coverage_map(true))?;
        let index = BinIndex::new(4, 4);
        assert_eq!(store.read_coverage(index)?, 0);

        store.write_coverage(index, COVERAGE_SURVEYED | COVERAGE_HAS_DATA)?;
        assert_eq!(store.read_coverage(index)?, COVERAGE_SURVEYED | COVERAGE_HAS_DATA);
        // Records are untouched by coverage writes.
        assert_eq!(store.read(index)?.avg_depth, header.null_depth);

        let (_, mut plain) = setup(&dir.path().join("e.bin"), &config())?;
        assert!(matches!(
            plain.read_coverage(index),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_short_file_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("f.bin");
        let (header, _) = setup(&path, &config())?;

        let mut file = IoKind::Large.open(&path, OpenMode::ReadWrite, DEFAULT_SEGMENT_SIZE)?;
        file.set_len(HEADER_SIZE as u64 + 10)?;
        assert!(matches!(
            BinStore::open(file, &header),
            Err(Error::InvalidHeader(_))
        ));
        Ok(())
    }
}
