//! Index file: per-bin chains of depth records stored in fixed-size slots.
//!
//! The file starts with a [`INDEX_HEADER_SIZE`] byte header holding the slot
//! size, slot count and the head of the released-slot free list. Slot `n`
//! (1-based) follows at `INDEX_HEADER_SIZE + (n - 1) * slot_size`.

use std::io;

use crate::bin::BinRecord;
use crate::bitpack::max_value;
use crate::chain::{ChainGuard, FreeList, SlotLinks, NULL_SLOT};
use crate::error::Result;
use crate::geometry::{BinIndex, Coord, Grid};
use crate::header::{BinHeader, DepthLayout};
use crate::io::{Backend, Endian};
use crate::validity::Validity;
use crate::Error;

pub const INDEX_HEADER_SIZE: usize = 64;
const INDEX_MAGIC: &[u8; 8] = b"PFMNDX\0\0";
const INDEX_VERSION: u16 = 1;

/// One sounding.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthRecord {
    pub file_number: u32,
    pub line_number: u32,
    pub ping_number: u32,
    pub beam_number: u32,
    pub coord: Coord,
    pub bin: BinIndex,
    pub depth: f64,
    pub validity: Validity,
    pub horizontal_error: f64,
    pub vertical_error: f64,
    pub attributes: Vec<f64>,
    /// Slot holding this record; set by reads and appends.
    pub address: Option<u64>,
}

impl DepthRecord {
    pub fn new(coord: Coord, depth: f64) -> Self {
        Self {
            file_number: 0,
            line_number: 0,
            ping_number: 0,
            beam_number: 0,
            coord,
            bin: BinIndex::default(),
            depth,
            validity: Validity::NONE,
            horizontal_error: 0.0,
            vertical_error: 0.0,
            attributes: Vec::new(),
            address: None,
        }
    }

    pub fn identifiers(mut self, file: u32, line: u32, ping: u32, beam: u32) -> Self {
        self.file_number = file;
        self.line_number = line;
        self.ping_number = ping;
        self.beam_number = beam;
        self
    }

    pub fn validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    /// Contributes to the unfiltered aggregates.
    pub fn is_counted(&self) -> bool {
        !self.validity.intersects(Validity::DELETED | Validity::REFERENCE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexHeader {
    endian: Endian,
    slot_size: u32,
    slot_count: u64,
    free_head: u64,
}

impl IndexHeader {
    fn encode(&self) -> [u8; INDEX_HEADER_SIZE] {
        let e = self.endian;
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        buf[..8].copy_from_slice(INDEX_MAGIC);
        buf[8..10].copy_from_slice(&e.tag_bytes());
        e.write_u16(&mut buf[10..12], INDEX_VERSION);
        e.write_u32(&mut buf[12..16], self.slot_size);
        e.write_u64(&mut buf[16..24], self.slot_count);
        e.write_u64(&mut buf[24..32], self.free_head);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < INDEX_HEADER_SIZE || &buf[..8] != INDEX_MAGIC {
            return Err(Error::InvalidHeader("not an index file".into()));
        }
        let endian = Endian::from_tag([buf[8], buf[9]])
            .ok_or_else(|| Error::InvalidHeader("unknown index endian tag".into()))?;
        let version = endian.read_u16(&buf[10..12]);
        if version > INDEX_VERSION {
            return Err(Error::VersionMismatch {
                found: version.to_string(),
                supported: INDEX_VERSION.to_string(),
            });
        }
        Ok(Self {
            endian,
            slot_size: endian.read_u32(&buf[12..16]),
            slot_count: endian.read_u64(&buf[16..24]),
            free_head: endian.read_u64(&buf[24..32]),
        })
    }
}

#[derive(Debug)]
pub struct DepthStore {
    file: Box<dyn Backend>,
    layout: DepthLayout,
    grid: Grid,
    header: IndexHeader,
    free: FreeList,
}

impl DepthStore {
    pub fn create(file: Box<dyn Backend>, bin_header: &BinHeader) -> Result<Self> {
        let layout = bin_header.depth_layout();
        let header = IndexHeader {
            endian: Endian::Big,
            slot_size: layout.record_size as u32,
            slot_count: 0,
            free_head: NULL_SLOT,
        };
        let mut store = Self {
            file,
            layout,
            grid: bin_header.grid,
            header,
            free: FreeList::default(),
        };
        store.file.set_len(0)?;
        store.write_header()?;
        store.file.sync()?;
        Ok(store)
    }

    pub fn open(mut file: Box<dyn Backend>, bin_header: &BinHeader) -> Result<Self> {
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        file.read_at(0, &mut buf)
            .map_err(|e| Error::InvalidHeader(format!("unable to read index header: {}", e)))?;
        let header = IndexHeader::decode(&buf)?;

        let layout = bin_header.depth_layout();
        if header.slot_size as usize != layout.record_size {
            return Err(Error::InvalidHeader(format!(
                "index slots are {} bytes, bin header implies {}",
                header.slot_size, layout.record_size
            )));
        }
        Ok(Self {
            file,
            layout,
            grid: bin_header.grid,
            free: FreeList::new(header.free_head),
            header,
        })
    }

    pub fn layout(&self) -> &DepthLayout {
        &self.layout
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.free_head = self.free.head();
        let buf = self.header.encode();
        self.file
            .write_at(0, &buf)
            .map_err(|source| Error::PointerWrite { slot: 0, source })?;
        Ok(())
    }

    /// Re-reads the slot count and free list head written by other handles.
    pub fn refresh(&mut self) -> Result<()> {
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        self.file.read_at(0, &mut buf)?;
        self.header = IndexHeader::decode(&buf)?;
        self.free = FreeList::new(self.header.free_head);
        Ok(())
    }

    fn slot_offset(&self, slot: u64) -> u64 {
        INDEX_HEADER_SIZE as u64 + (slot - 1) * self.header.slot_size as u64
    }

    fn read_slot(&mut self, slot: u64) -> Result<Vec<u8>> {
        let offset = self.slot_offset(slot);
        let mut buf = vec![0u8; self.header.slot_size as usize];
        self.file
            .read_at(offset, &mut buf)
            .map_err(|source| Error::DepthRead { slot, source })?;
        Ok(buf)
    }

    fn write_slot(&mut self, slot: u64, buf: &[u8]) -> Result<()> {
        let offset = self.slot_offset(slot);
        self.file
            .write_at(offset, buf)
            .map_err(|source| Error::DepthWrite { slot, source })?;
        Ok(())
    }

    fn encode(&self, record: &DepthRecord, next: u64) -> Result<Vec<u8>> {
        let l = &self.layout;
        let mut buf = vec![0u8; self.header.slot_size as usize];
        let origin = self.grid.origin(record.bin)?;
        let offset_max = max_value(l.x_offset.bits) as f64;
        let fraction = |value: f64, start: f64, size: f64| {
            (((value - start) / size).clamp(0.0, 1.0) * offset_max).round() as u64
        };

        l.row.write(&mut buf, record.bin.row as u64)?;
        l.col.write(&mut buf, record.bin.col as u64)?;
        l.file_number.write(&mut buf, record.file_number as u64)?;
        l.line_number.write(&mut buf, record.line_number as u64)?;
        l.ping_number.write(&mut buf, record.ping_number as u64)?;
        l.beam_number.write(&mut buf, record.beam_number as u64)?;
        l.x_offset.write(&mut buf, fraction(record.coord.x, origin.x, self.grid.x_bin_size))?;
        l.y_offset.write(&mut buf, fraction(record.coord.y, origin.y, self.grid.y_bin_size))?;
        l.depth.write(&mut buf, record.depth)?;
        l.validity.write(&mut buf, record.validity.bits() as u64)?;
        l.horizontal_error.write(&mut buf, record.horizontal_error)?;
        l.vertical_error.write(&mut buf, record.vertical_error)?;
        for (field, value) in l.attributes.iter().zip(&record.attributes) {
            field.write(&mut buf, *value)?;
        }
        l.next.write(&mut buf, next)?;
        Ok(buf)
    }

    fn decode(&self, buf: &[u8], slot: u64) -> Result<DepthRecord> {
        let l = &self.layout;
        let bin = BinIndex::new(l.row.read(buf) as u32, l.col.read(buf) as u32);
        let origin = self.grid.origin(bin)?;
        let coord = if l.x_offset.bits == 0 {
            self.grid.center(bin)?
        } else {
            let offset_max = max_value(l.x_offset.bits) as f64;
            Coord::new(
                origin.x + l.x_offset.read(buf) as f64 / offset_max * self.grid.x_bin_size,
                origin.y + l.y_offset.read(buf) as f64 / offset_max * self.grid.y_bin_size,
            )
        };
        Ok(DepthRecord {
            file_number: l.file_number.read(buf) as u32,
            line_number: l.line_number.read(buf) as u32,
            ping_number: l.ping_number.read(buf) as u32,
            beam_number: l.beam_number.read(buf) as u32,
            coord,
            bin,
            depth: l.depth.read(buf),
            validity: Validity::from_bits(l.validity.read(buf) as u32),
            horizontal_error: l.horizontal_error.read(buf),
            vertical_error: l.vertical_error.read(buf),
            attributes: l.attributes.iter().map(|a| a.read(buf)).collect(),
            address: Some(slot),
        })
    }

    /// `record` as reading it back from its slot would return it.
    pub fn normalize(&self, record: &DepthRecord) -> Result<DepthRecord> {
        self.check_attributes(record)?;
        let buf = self.encode(record, NULL_SLOT)?;
        let mut stored = self.decode(&buf, NULL_SLOT)?;
        stored.address = record.address;
        Ok(stored)
    }

    fn check_attributes(&self, record: &DepthRecord) -> Result<()> {
        if record.attributes.len() != self.layout.attributes.len() {
            return Err(Error::InvalidOperation(format!(
                "record carries {} attributes, header defines {}",
                record.attributes.len(),
                self.layout.attributes.len()
            )));
        }
        Ok(())
    }

    /// Reads the record in `slot` without any chain checks.
    pub fn read_at(&mut self, slot: u64) -> Result<DepthRecord> {
        self.check_slot(slot)?;
        let buf = self.read_slot(slot)?;
        self.decode(&buf, slot)
    }

    fn check_slot(&self, slot: u64) -> Result<()> {
        if slot == NULL_SLOT || slot > self.slot_limit()? {
            return Err(Error::DepthRead {
                slot,
                source: io::Error::new(io::ErrorKind::InvalidInput, "slot out of range"),
            });
        }
        Ok(())
    }

    /// Slots in the file, including ones appended by other handles since open.
    fn slot_limit(&self) -> Result<u64> {
        let on_disk = self
            .file
            .len()?
            .saturating_sub(INDEX_HEADER_SIZE as u64)
            / self.header.slot_size.max(1) as u64;
        Ok(on_disk.max(self.header.slot_count))
    }

    fn allocate(&mut self) -> Result<u64> {
        let mut free = self.free;
        if let Some(slot) = free.pop(self)? {
            self.free = free;
            return Ok(slot);
        }
        let slot = self.header.slot_count + 1;
        if slot > max_value(self.layout.next.bits) {
            return Err(Error::Overflow {
                field: "continuation pointer",
                value: slot as i128,
                bits: self.layout.next.bits,
            });
        }
        self.header.slot_count = slot;
        Ok(slot)
    }

    /// Appends `record` to the tail of `bin`'s chain.
    ///
    /// Updates the chain pointers and sounding counts of `bin` in memory; the
    /// caller writes the bin record back.
    pub fn append(&mut self, bin: &mut BinRecord, record: &mut DepthRecord) -> Result<u64> {
        if record.bin != bin.index {
            return Err(Error::ChainMismatch(format!(
                "record for bin ({}, {}) appended to bin ({}, {})",
                record.bin.row, record.bin.col, bin.index.row, bin.index.col
            )));
        }
        self.check_attributes(record)?;
        // Encode first so an overflowing field leaves the file untouched.
        let buf = self.encode(record, NULL_SLOT)?;

        let slot = self.allocate()?;
        self.write_slot(slot, &buf)?;
        if bin.tail != NULL_SLOT {
            self.set_next(bin.tail, slot)?;
        } else {
            bin.head = slot;
        }
        bin.tail = slot;
        bin.num_soundings += 1;
        if record.is_counted() {
            bin.count += 1;
        }
        if !record.validity.is_deleted() {
            bin.validity.insert(Validity::DATA);
        }
        self.write_header()?;

        record.address = Some(slot);
        Ok(slot)
    }

    /// Returns `bin`'s chain in insertion order.
    pub fn read_chain(&mut self, bin: &BinRecord) -> Result<Vec<DepthRecord>> {
        let limit = self.slot_limit()?;
        if limit > self.header.slot_count {
            self.refresh()?;
        }
        let mut guard = ChainGuard::new(limit, bin.index.row, bin.index.col);
        let mut records = Vec::with_capacity(bin.num_soundings.min(limit) as usize);
        let mut slot = bin.head;
        let mut last = NULL_SLOT;
        while slot != NULL_SLOT {
            guard.visit(slot)?;
            let buf = self.read_slot(slot)?;
            let record = self.decode(&buf, slot)?;
            if record.bin != bin.index {
                return Err(Error::ChainMismatch(format!(
                    "slot {} holds a record for bin ({}, {}) in the chain of bin ({}, {})",
                    slot, record.bin.row, record.bin.col, bin.index.row, bin.index.col
                )));
            }
            last = slot;
            slot = self.layout.next.read(&buf);
            records.push(record);
        }
        if last != bin.tail {
            return Err(Error::ChainMismatch(format!(
                "chain of bin ({}, {}) ends at slot {}, tail pointer is {}",
                bin.index.row, bin.index.col, last, bin.tail
            )));
        }
        if records.len() as u64 != bin.num_soundings {
            return Err(Error::ChainMismatch(format!(
                "chain of bin ({}, {}) holds {} records, bin counts {}",
                bin.index.row,
                bin.index.col,
                records.len(),
                bin.num_soundings
            )));
        }
        Ok(records)
    }

    fn resident(&mut self, record: &DepthRecord) -> Result<(u64, Vec<u8>)> {
        let slot = record.address.ok_or_else(|| {
            Error::InvalidOperation("depth record was not read from this structure".into())
        })?;
        self.check_slot(slot)?;
        let buf = self.read_slot(slot)?;
        let l = &self.layout;
        let stored = BinIndex::new(l.row.read(&buf) as u32, l.col.read(&buf) as u32);
        if stored != record.bin {
            return Err(Error::ChainMismatch(format!(
                "slot {} belongs to bin ({}, {}), not ({}, {})",
                slot, stored.row, stored.col, record.bin.row, record.bin.col
            )));
        }
        Ok((slot, buf))
    }

    /// Rewrites a previously read record in its own slot, keeping its chain link.
    pub fn update(&mut self, record: &DepthRecord) -> Result<()> {
        let (slot, old) = self.resident(record)?;
        let next = self.layout.next.read(&old);
        let buf = self.encode(record, next)?;
        self.write_slot(slot, &buf)
    }

    /// Rewrites only the validity bits of a previously read record.
    pub fn update_validity(&mut self, record: &DepthRecord) -> Result<()> {
        let (slot, mut buf) = self.resident(record)?;
        self.layout
            .validity
            .write(&mut buf, record.validity.bits() as u64)?;
        self.write_slot(slot, &buf)
    }

    /// Unlinks `DELETED` records from `bin`'s chain and releases their slots.
    ///
    /// Returns the number of records removed.
    pub fn purge(&mut self, bin: &mut BinRecord) -> Result<u64> {
        let chain = self.read_chain(bin)?;
        let (keep, drop): (Vec<_>, Vec<_>) = chain
            .into_iter()
            .partition(|r| !r.validity.is_deleted());
        if drop.is_empty() {
            return Ok(0);
        }

        let slots: Vec<u64> = keep.iter().filter_map(|r| r.address).collect();
        for pair in slots.windows(2) {
            self.set_next(pair[0], pair[1])?;
        }
        if let Some(&last) = slots.last() {
            self.set_next(last, NULL_SLOT)?;
        }
        let mut free = self.free;
        for record in &drop {
            if let Some(slot) = record.address {
                free.push(self, slot)?;
            }
        }
        self.free = free;

        bin.head = slots.first().copied().unwrap_or(NULL_SLOT);
        bin.tail = slots.last().copied().unwrap_or(NULL_SLOT);
        bin.num_soundings = slots.len() as u64;
        bin.count = keep.iter().filter(|r| r.is_counted()).count() as u32;
        self.write_header()?;
        tracing::debug!(
            row = bin.index.row,
            col = bin.index.col,
            released = drop.len(),
            "Purged deleted soundings"
        );
        Ok(drop.len() as u64)
    }

    pub fn free_slots(&mut self) -> Result<u64> {
        let free = self.free;
        free.len(self)
    }

    pub fn slot_count(&self) -> u64 {
        self.header.slot_count
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync()
    }

    pub fn commit(&mut self) -> io::Result<()> {
        self.file.commit()
    }
}

impl SlotLinks for DepthStore {
    fn slot_count(&self) -> u64 {
        self.header.slot_count
    }

    fn next(&mut self, slot: u64) -> Result<u64> {
        let offset = self.slot_offset(slot);
        let mut buf = vec![0u8; self.header.slot_size as usize];
        self.file
            .read_at(offset, &mut buf)
            .map_err(|source| Error::PointerRead { slot, source })?;
        Ok(self.layout.next.read(&buf))
    }

    fn set_next(&mut self, slot: u64, next: u64) -> Result<()> {
        let mut buf = self.read_slot(slot)?;
        self.layout.next.write(&mut buf, next)?;
        let offset = self.slot_offset(slot);
        self.file
            .write_at(offset, &buf)
            .map_err(|source| Error::PointerWrite { slot, source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin::BinStore;
    use crate::geometry::Mbr;
    use crate::header::HeaderConfig;
    use crate::io::{IoKind, OpenMode, DEFAULT_SEGMENT_SIZE};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        header: BinHeader,
        bins: BinStore,
        depths: DepthStore,
    }

    fn fixture() -> Result<Fixture> {
        let dir = tempdir()?;
        let config = HeaderConfig::new(Mbr::new(0.0, 0.0, 10.0, 10.0), 1.0)
            .depth_range(-10.0, 100.0, 100.0);
        let header = BinHeader::new(&config)?;
        let bins = BinStore::create(
            IoKind::Large.open(&dir.path().join("t.bin"), OpenMode::Create, DEFAULT_SEGMENT_SIZE)?,
            &header,
        )?;
        let depths = DepthStore::create(
            IoKind::Large.open(&dir.path().join("t.ndx"), OpenMode::Create, DEFAULT_SEGMENT_SIZE)?,
            &header,
        )?;
        Ok(Fixture {
            _dir: dir,
            header,
            bins,
            depths,
        })
    }

    fn sounding(bin: BinIndex, depth: f64, beam: u32) -> DepthRecord {
        let mut record = DepthRecord::new(
            Coord::new(bin.col as f64 + 0.25, bin.row as f64 + 0.75),
            depth,
        )
        .identifiers(1, 2, 3, beam);
        record.bin = bin;
        record
    }

    #[test]
    fn test_append_preserves_order() -> Result<()> {
        let mut f = fixture()?;
        let index = BinIndex::new(5, 5);
        let mut bin = f.bins.read(index)?;

        for beam in 0..5 {
            let mut record = sounding(index, 10.0 + beam as f64, beam);
            f.depths.append(&mut bin, &mut record)?;
            assert_eq!(record.address, Some(beam as u64 + 1));
        }
        assert_eq!(bin.num_soundings, 5);
        assert_eq!(bin.count, 5);
        assert!(bin.validity.contains(Validity::DATA));
        f.bins.write(&mut f.header.stats, &bin)?;

        let bin = f.bins.read(index)?;
        let chain = f.depths.read_chain(&bin)?;
        let beams: Vec<u32> = chain.iter().map(|r| r.beam_number).collect();
        assert_eq!(beams, vec![0, 1, 2, 3, 4]);
        assert_eq!(chain[2].depth, 12.0);
        assert!((chain[0].coord.x - 5.25).abs() < 1e-4);
        assert!((chain[0].coord.y - 5.75).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_self_loop_detected() -> Result<()> {
        let mut f = fixture()?;
        let index = BinIndex::new(1, 1);
        let mut bin = f.bins.read(index)?;
        let mut record = sounding(index, 5.0, 0);
        let slot = f.depths.append(&mut bin, &mut record)?;

        f.depths.set_next(slot, slot)?;
        assert!(matches!(
            f.depths.read_chain(&bin),
            Err(Error::ChainCycle { row: 1, col: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_foreign_record_in_chain() -> Result<()> {
        let mut f = fixture()?;
        let mut a = f.bins.read(BinIndex::new(0, 0))?;
        let mut b = f.bins.read(BinIndex::new(0, 1))?;
        let (ia, ib) = (a.index, b.index);
        let first = f.depths.append(&mut a, &mut sounding(ia, 1.0, 0))?;
        let other = f.depths.append(&mut b, &mut sounding(ib, 2.0, 0))?;

        f.depths.set_next(first, other)?;
        assert!(matches!(
            f.depths.read_chain(&a),
            Err(Error::ChainMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_corrupt_sounding_count() -> Result<()> {
        let mut f = fixture()?;
        let index = BinIndex::new(5, 5);
        let mut bin = f.bins.read(index)?;
        f.depths.append(&mut bin, &mut sounding(index, 4.0, 0))?;

        bin.num_soundings = u32::MAX as u64;
        assert!(matches!(
            f.depths.read_chain(&bin),
            Err(Error::ChainMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_update_in_place_keeps_link() -> Result<()> {
        let mut f = fixture()?;
        let index = BinIndex::new(3, 4);
        let mut bin = f.bins.read(index)?;
        for beam in 0..3 {
            f.depths.append(&mut bin, &mut sounding(index, 20.0, beam))?;
        }

        let mut chain = f.depths.read_chain(&bin)?;
        chain[1].depth = 21.5;
        chain[1].ping_number = 99;
        f.depths.update(&chain[1])?;

        chain[2].validity = Validity::MANUALLY_INVAL;
        chain[2].depth = 80.0;
        f.depths.update_validity(&chain[2])?;

        let reread = f.depths.read_chain(&bin)?;
        assert_eq!(reread.len(), 3);
        assert_eq!(reread[1].depth, 21.5);
        assert_eq!(reread[1].ping_number, 99);
        assert_eq!(reread[2].validity, Validity::MANUALLY_INVAL);
        // Only validity is rewritten on the light path.
        assert_eq!(reread[2].depth, 20.0);

        let detached = sounding(index, 1.0, 0);
        assert!(matches!(
            f.depths.update(&detached),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_identifier_overflow() -> Result<()> {
        let mut f = fixture()?;
        let index = BinIndex::new(0, 0);
        let mut bin = f.bins.read(index)?;
        let mut record = sounding(index, 1.0, 0);
        record.beam_number = 1 << 12;
        assert!(matches!(
            f.depths.append(&mut bin, &mut record),
            Err(Error::Overflow { field: "beam number", .. })
        ));
        assert_eq!(f.depths.slot_count(), 0);
        assert_eq!(bin.head, NULL_SLOT);
        Ok(())
    }

    #[test]
    fn test_purge_reuses_slots() -> Result<()> {
        let mut f = fixture()?;
        let index = BinIndex::new(2, 2);
        let mut bin = f.bins.read(index)?;
        for beam in 0..4 {
            let validity = if beam % 2 == 0 {
                Validity::DELETED
            } else {
                Validity::NONE
            };
            f.depths
                .append(&mut bin, &mut sounding(index, 30.0, beam).validity(validity))?;
        }
        assert_eq!(bin.count, 2);

        assert_eq!(f.depths.purge(&mut bin)?, 2);
        assert_eq!(bin.num_soundings, 2);
        assert_eq!((bin.head, bin.tail), (2, 4));
        assert_eq!(f.depths.free_slots()?, 2);

        let chain = f.depths.read_chain(&bin)?;
        assert_eq!(chain.iter().map(|r| r.beam_number).collect::<Vec<_>>(), vec![1, 3]);

        let other_index = BinIndex::new(7, 7);
        let mut other = f.bins.read(other_index)?;
        let reused = f.depths.append(&mut other, &mut sounding(other_index, 1.0, 9))?;
        assert!(reused == 1 || reused == 3);
        assert_eq!(f.depths.slot_count(), 4);
        assert_eq!(f.depths.free_slots()?, 1);
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_free_list() -> Result<()> {
        let dir = tempdir()?;
        let header = BinHeader::new(&HeaderConfig::new(Mbr::new(0.0, 0.0, 4.0, 4.0), 1.0))?;
        let path = dir.path().join("r.ndx");
        let mut bin = BinStore::create(
            IoKind::Huge.open(&dir.path().join("r.bin"), OpenMode::Create, 4096)?,
            &header,
        )?
        .read(BinIndex::new(0, 0))?;
        {
            let mut depths = DepthStore::create(
                IoKind::Huge.open(&path, OpenMode::Create, 4096)?,
                &header,
            )?;
            let index = bin.index;
            for beam in 0..3 {
                depths.append(
                    &mut bin,
                    &mut sounding(index, 1.0, beam).validity(Validity::DELETED),
                )?;
            }
            assert!(!bin.validity.contains(Validity::DATA));
            depths.purge(&mut bin)?;
        }
        let mut depths =
            DepthStore::open(IoKind::Huge.open(&path, OpenMode::ReadWrite, 4096)?, &header)?;
        assert_eq!(depths.slot_count(), 3);
        assert_eq!(depths.free_slots()?, 3);
        Ok(())
    }
}
