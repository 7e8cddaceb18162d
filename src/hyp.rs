//! Hypothesis (`.hyp`) file: per-bin depth hypotheses from an external
//! uncertainty estimator, laid out on the bin grid of an existing structure.
//!
//! Layout:
//! - `[0, ASCII_SIZE)`: banner plus `[TAG] = value` text.
//! - `[ASCII_SIZE, DATA_START)`: binary header (endian tag, free list head,
//!   file size, grid dimensions, reserved attribute references, parameters).
//! - One [`NODE_SIZE`] node per bin, row major.
//! - A slot arena of [`HYPOTHESIS_SIZE`] hypothesis records, 1-based.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use crate::chain::{ChainGuard, FreeList, SlotLinks, NULL_SLOT};
use crate::error::Result;
use crate::geometry::{BinIndex, Grid};
use crate::header::tags::{version_hundredths, TagWriter, Tags};
use crate::header::{BinHeader, ReservedAttribute};
use crate::io::{Backend, Endian, IoKind, OpenMode, DEFAULT_SEGMENT_SIZE};
use crate::Error;

pub const ASCII_SIZE: usize = 1024;
pub const BINARY_SIZE: usize = 128;
const DATA_START: u64 = (ASCII_SIZE + BINARY_SIZE) as u64;
pub const NODE_SIZE: usize = 16;
pub const HYPOTHESIS_SIZE: usize = 24;

/// Version in hundredths (2.00).
pub const HYP_VERSION: u32 = 200;
const BANNER: &str = "Hypothesis Library - Version 2.00";
const LEGACY_BANNER_PREFIX: &str = "PCube Library";
const BANNER_PREFIX: &str = "Hypothesis Library";

/// No attribute slot referenced.
const NO_ATTRIBUTE: u16 = u16::MAX;

/// Estimator parameters recorded with the file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HypParams {
    pub capture_distance: f64,
    pub horizontal_error_scale: f64,
    pub distance_exponent: f64,
    pub min_context: f64,
    pub max_context: f64,
    pub selection: u32,
}

impl Default for HypParams {
    fn default() -> Self {
        Self {
            capture_distance: 0.05,
            horizontal_error_scale: 2.95,
            distance_exponent: 2.0,
            min_context: 0.0,
            max_context: 5.0,
            selection: 0,
        }
    }
}

/// Per-bin node: the selected hypothesis and the chain of candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HypNode {
    pub best: f32,
    pub count: u32,
    pub head: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hypothesis {
    pub value: f32,
    pub variance: f32,
    pub samples: u32,
    pub avg_tpe: f32,
    pub address: Option<u64>,
}

impl Hypothesis {
    pub fn new(value: f32, variance: f32, samples: u32, avg_tpe: f32) -> Self {
        Self {
            value,
            variance,
            samples,
            avg_tpe,
            address: None,
        }
    }
}

/// Bin attribute slots that mirror hypothesis results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributeRefs {
    pub count: Option<u16>,
    pub std_dev: Option<u16>,
    pub avg_tpe: Option<u16>,
}

impl AttributeRefs {
    fn from_header(header: &BinHeader) -> Self {
        let find = |r| header.find_reserved(r).map(|i| i as u16);
        Self {
            count: find(ReservedAttribute::HypothesisCount),
            std_dev: find(ReservedAttribute::HypothesisStdDev),
            avg_tpe: find(ReservedAttribute::AverageTpe),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BinaryHeader {
    endian: Endian,
    free_head: u64,
    file_size: u64,
    rows: u32,
    cols: u32,
    slot_count: u64,
    refs: AttributeRefs,
    params: HypParams,
}

impl BinaryHeader {
    fn encode(&self) -> [u8; BINARY_SIZE] {
        let e = self.endian;
        let mut buf = [0u8; BINARY_SIZE];
        buf[0..2].copy_from_slice(&e.tag_bytes());
        e.write_u64(&mut buf[2..10], self.free_head);
        e.write_u64(&mut buf[10..18], self.file_size);
        e.write_u32(&mut buf[18..22], self.rows);
        e.write_u32(&mut buf[22..26], self.cols);
        e.write_u64(&mut buf[26..34], self.slot_count);
        let refs = [self.refs.count, self.refs.std_dev, self.refs.avg_tpe];
        for (i, r) in refs.iter().enumerate() {
            e.write_u16(&mut buf[34 + i * 2..36 + i * 2], r.unwrap_or(NO_ATTRIBUTE));
        }
        let p = &self.params;
        let floats = [
            p.capture_distance,
            p.horizontal_error_scale,
            p.distance_exponent,
            p.min_context,
            p.max_context,
        ];
        for (i, value) in floats.iter().enumerate() {
            e.write_f64(&mut buf[40 + i * 8..48 + i * 8], *value);
        }
        e.write_u32(&mut buf[80..84], p.selection);
        buf
    }

    /// Decodes assuming `endian`, whatever the stored tag says.
    fn decode(buf: &[u8], endian: Endian) -> Self {
        let e = endian;
        let reference = |at: usize| match e.read_u16(&buf[at..at + 2]) {
            NO_ATTRIBUTE => None,
            i => Some(i),
        };
        let float = |i: usize| e.read_f64(&buf[40 + i * 8..48 + i * 8]);
        Self {
            endian,
            free_head: e.read_u64(&buf[2..10]),
            file_size: e.read_u64(&buf[10..18]),
            rows: e.read_u32(&buf[18..22]),
            cols: e.read_u32(&buf[22..26]),
            slot_count: e.read_u64(&buf[26..34]),
            refs: AttributeRefs {
                count: reference(34),
                std_dev: reference(36),
                avg_tpe: reference(38),
            },
            params: HypParams {
                capture_distance: float(0),
                horizontal_error_scale: float(1),
                distance_exponent: float(2),
                min_context: float(3),
                max_context: float(4),
                selection: e.read_u32(&buf[80..84]),
            },
        }
    }
}

#[derive(Debug)]
pub struct HypFile {
    path: PathBuf,
    file: Box<dyn Backend>,
    grid: Grid,
    null_value: f32,
    header: BinaryHeader,
    free: FreeList,
}

impl HypFile {
    /// Creates a hypothesis file sized to `bin_header`'s grid. Existing files are never overwritten.
    pub fn create(path: &Path, bin_header: &BinHeader, params: HypParams) -> Result<Self> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::FileExists(path.into()),
                _ => Error::Open(path.into(), e),
            })?;
        let file = IoKind::Large.open(path, OpenMode::Create, DEFAULT_SEGMENT_SIZE)?;

        let grid = bin_header.grid;
        let header = BinaryHeader {
            endian: Endian::Big,
            free_head: NULL_SLOT,
            file_size: DATA_START + grid.bin_count() * NODE_SIZE as u64,
            rows: grid.height,
            cols: grid.width,
            slot_count: 0,
            refs: AttributeRefs::from_header(bin_header),
            params,
        };
        let mut hyp = Self {
            path: path.to_path_buf(),
            file,
            grid,
            null_value: bin_header.null_depth as f32,
            header,
            free: FreeList::default(),
        };

        let mut ascii = TagWriter::new();
        ascii
            .line(BANNER)
            .put("BIN FILE VERSION", &bin_header.version)
            .put("BIN WIDTH", grid.width)
            .put("BIN HEIGHT", grid.height);
        let text = ascii.finish();
        if text.len() > ASCII_SIZE {
            return Err(Error::InvalidHeader("hypothesis banner too long".into()));
        }
        let mut block = vec![0u8; ASCII_SIZE];
        block[..text.len()].copy_from_slice(text.as_bytes());
        hyp.file.write_at(0, &block)?;
        hyp.write_header()?;

        let empty = hyp.encode_node(&HypNode {
            best: hyp.null_value,
            count: 0,
            head: NULL_SLOT,
        });
        let row: Vec<u8> = empty
            .iter()
            .copied()
            .cycle()
            .take(NODE_SIZE * grid.width as usize)
            .collect();
        for r in 0..grid.height {
            let offset = hyp.node_offset(BinIndex::new(r, 0));
            hyp.file.write_at(offset, &row)?;
        }
        hyp.file.sync()?;
        tracing::info!(path = %path.display(), rows = grid.height, cols = grid.width, "Created hypothesis file");
        Ok(hyp)
    }

    /// Opens a hypothesis file and checks that it matches `bin_header`'s grid.
    ///
    /// A file whose stored dimensions disagree is re-read once with the
    /// opposite byte order before the mismatch is reported.
    pub fn open(path: &Path, bin_header: &BinHeader, writable: bool) -> Result<Self> {
        let mode = if writable {
            OpenMode::ReadWrite
        } else {
            OpenMode::Read
        };
        let mut file = IoKind::Large.open(path, mode, DEFAULT_SEGMENT_SIZE)?;

        let mut ascii = vec![0u8; ASCII_SIZE];
        file.read_at(0, &mut ascii)
            .map_err(|e| Error::InvalidHeader(format!("unable to read hypothesis header: {}", e)))?;
        check_banner(&ascii)?;

        let mut raw = [0u8; BINARY_SIZE];
        file.read_at(ASCII_SIZE as u64, &mut raw)?;
        let tagged = Endian::from_tag([raw[0], raw[1]])
            .ok_or_else(|| Error::InvalidHeader("unknown hypothesis endian tag".into()))?;

        let grid = bin_header.grid;
        let expected = (grid.height, grid.width);
        let mut header = BinaryHeader::decode(&raw, tagged);
        if (header.rows, header.cols) != expected {
            let swapped = BinaryHeader::decode(&raw, tagged.opposite());
            if (swapped.rows, swapped.cols) != expected {
                return Err(Error::GeometryMismatch {
                    expected,
                    found: (header.rows, header.cols),
                });
            }
            tracing::warn!(
                path = %path.display(),
                tagged = ?tagged,
                using = ?swapped.endian,
                "Hypothesis file endian tag disagrees with its contents"
            );
            header = swapped;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            grid,
            null_value: bin_header.null_depth as f32,
            free: FreeList::new(header.free_head),
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endian(&self) -> Endian {
        self.header.endian
    }

    pub fn params(&self) -> &HypParams {
        &self.header.params
    }

    pub fn attribute_refs(&self) -> &AttributeRefs {
        &self.header.refs
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.free_head = self.free.head();
        let buf = self.header.encode();
        self.file.write_at(ASCII_SIZE as u64, &buf)?;
        Ok(())
    }

    fn node_offset(&self, index: BinIndex) -> u64 {
        DATA_START + self.grid.linear(index) * NODE_SIZE as u64
    }

    fn slot_offset(&self, slot: u64) -> u64 {
        DATA_START
            + self.grid.bin_count() * NODE_SIZE as u64
            + (slot - 1) * HYPOTHESIS_SIZE as u64
    }

    fn encode_node(&self, node: &HypNode) -> [u8; NODE_SIZE] {
        let e = self.header.endian;
        let mut buf = [0u8; NODE_SIZE];
        e.write_f32(&mut buf[0..4], node.best);
        e.write_u32(&mut buf[4..8], node.count);
        e.write_u64(&mut buf[8..16], node.head);
        buf
    }

    pub fn read_node(&mut self, index: BinIndex) -> Result<HypNode> {
        self.grid.check(index)?;
        let mut buf = [0u8; NODE_SIZE];
        let offset = self.node_offset(index);
        self.file
            .read_at(offset, &mut buf)
            .map_err(|source| Error::BinRead {
                row: index.row,
                col: index.col,
                source,
            })?;
        let e = self.header.endian;
        Ok(HypNode {
            best: e.read_f32(&buf[0..4]),
            count: e.read_u32(&buf[4..8]),
            head: e.read_u64(&buf[8..16]),
        })
    }

    fn write_node(&mut self, index: BinIndex, node: &HypNode) -> Result<()> {
        self.grid.check(index)?;
        let buf = self.encode_node(node);
        let offset = self.node_offset(index);
        self.file
            .write_at(offset, &buf)
            .map_err(|source| Error::BinWrite {
                row: index.row,
                col: index.col,
                source,
            })?;
        Ok(())
    }

    fn read_slot(&mut self, slot: u64) -> Result<(Hypothesis, u64)> {
        if slot == NULL_SLOT || slot > self.header.slot_count {
            return Err(Error::DepthRead {
                slot,
                source: io::Error::new(io::ErrorKind::InvalidInput, "hypothesis slot out of range"),
            });
        }
        let mut buf = [0u8; HYPOTHESIS_SIZE];
        let offset = self.slot_offset(slot);
        self.file
            .read_at(offset, &mut buf)
            .map_err(|source| Error::DepthRead { slot, source })?;
        let e = self.header.endian;
        let hypothesis = Hypothesis {
            value: e.read_f32(&buf[0..4]),
            variance: e.read_f32(&buf[4..8]),
            samples: e.read_u32(&buf[8..12]),
            avg_tpe: e.read_f32(&buf[12..16]),
            address: Some(slot),
        };
        Ok((hypothesis, e.read_u64(&buf[16..24])))
    }

    fn write_slot(&mut self, slot: u64, hypothesis: &Hypothesis, next: u64) -> Result<()> {
        let e = self.header.endian;
        let mut buf = [0u8; HYPOTHESIS_SIZE];
        e.write_f32(&mut buf[0..4], hypothesis.value);
        e.write_f32(&mut buf[4..8], hypothesis.variance);
        e.write_u32(&mut buf[8..12], hypothesis.samples);
        e.write_f32(&mut buf[12..16], hypothesis.avg_tpe);
        e.write_u64(&mut buf[16..24], next);
        let offset = self.slot_offset(slot);
        self.file
            .write_at(offset, &buf)
            .map_err(|source| Error::DepthWrite { slot, source })?;
        Ok(())
    }

    fn allocate(&mut self) -> Result<u64> {
        let mut free = self.free;
        if let Some(slot) = free.pop(self)? {
            self.free = free;
            return Ok(slot);
        }
        self.header.slot_count += 1;
        self.header.file_size += HYPOTHESIS_SIZE as u64;
        Ok(self.header.slot_count)
    }

    /// Returns the node's hypotheses, most recently added first.
    pub fn read_hypotheses(&mut self, index: BinIndex) -> Result<Vec<Hypothesis>> {
        let node = self.read_node(index)?;
        let mut guard = ChainGuard::new(self.header.slot_count, index.row, index.col);
        let mut out = Vec::with_capacity(node.count as usize);
        let mut slot = node.head;
        while slot != NULL_SLOT {
            guard.visit(slot)?;
            let (hypothesis, next) = self.read_slot(slot)?;
            out.push(hypothesis);
            slot = next;
        }
        if out.len() != node.count as usize {
            return Err(Error::ChainMismatch(format!(
                "node ({}, {}) records {} hypotheses, chain holds {}",
                index.row,
                index.col,
                node.count,
                out.len()
            )));
        }
        Ok(out)
    }

    /// Links a new hypothesis at the head of the node's chain.
    pub fn add_hypothesis(&mut self, index: BinIndex, hypothesis: &mut Hypothesis) -> Result<u64> {
        let mut node = self.read_node(index)?;
        let slot = self.allocate()?;
        self.write_slot(slot, hypothesis, node.head)?;
        node.head = slot;
        node.count += 1;
        self.write_node(index, &node)?;
        self.write_header()?;
        hypothesis.address = Some(slot);
        Ok(slot)
    }

    /// Rewrites a previously read hypothesis in its own slot.
    pub fn update_hypothesis(&mut self, hypothesis: &Hypothesis) -> Result<()> {
        let slot = hypothesis.address.ok_or_else(|| {
            Error::InvalidOperation("hypothesis was not read from this file".into())
        })?;
        let (_, next) = self.read_slot(slot)?;
        self.write_slot(slot, hypothesis, next)
    }

    pub fn set_best(&mut self, index: BinIndex, best: f32) -> Result<()> {
        let mut node = self.read_node(index)?;
        node.best = best;
        self.write_node(index, &node)
    }

    /// Releases every hypothesis of a node to the free list and resets the node.
    pub fn clear_node(&mut self, index: BinIndex) -> Result<u32> {
        let hypotheses = self.read_hypotheses(index)?;
        let mut free = self.free;
        for slot in hypotheses.iter().filter_map(|h| h.address) {
            free.push(self, slot)?;
        }
        self.free = free;
        let node = HypNode {
            best: self.null_value,
            count: 0,
            head: NULL_SLOT,
        };
        self.write_node(index, &node)?;
        self.write_header()?;
        Ok(hypotheses.len() as u32)
    }

    pub fn free_slots(&mut self) -> Result<u64> {
        let free = self.free;
        free.len(self)
    }

    pub fn slot_count(&self) -> u64 {
        self.header.slot_count
    }

    pub fn sync(&mut self) -> Result<()> {
        self.write_header()?;
        self.file.sync()?;
        Ok(())
    }
}

impl SlotLinks for HypFile {
    fn slot_count(&self) -> u64 {
        self.header.slot_count
    }

    fn next(&mut self, slot: u64) -> Result<u64> {
        let e = self.header.endian;
        let mut buf = [0u8; 8];
        let offset = self.slot_offset(slot) + 16;
        self.file
            .read_at(offset, &mut buf)
            .map_err(|source| Error::PointerRead { slot, source })?;
        Ok(e.read_u64(&buf))
    }

    fn set_next(&mut self, slot: u64, next: u64) -> Result<()> {
        let e = self.header.endian;
        let mut buf = [0u8; 8];
        e.write_u64(&mut buf, next);
        let offset = self.slot_offset(slot) + 16;
        self.file
            .write_at(offset, &buf)
            .map_err(|source| Error::PointerWrite { slot, source })?;
        Ok(())
    }
}

fn check_banner(block: &[u8]) -> Result<()> {
    let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
    let text = std::str::from_utf8(&block[..end])
        .map_err(|_| Error::InvalidHeader("hypothesis header is not valid UTF-8".into()))?;
    let tags = Tags::parse(text);
    let banner = tags
        .banner()
        .iter()
        .find(|line| line.starts_with(BANNER_PREFIX) || line.starts_with(LEGACY_BANNER_PREFIX))
        .ok_or_else(|| Error::InvalidHeader("not a hypothesis file".into()))?;
    let version = version_hundredths(banner)
        .ok_or_else(|| Error::InvalidHeader(format!("unreadable version {:?}", banner)))?;
    if version > HYP_VERSION {
        return Err(Error::VersionMismatch {
            found: format!("{:.2}", version as f64 / 100.0),
            supported: format!("{:.2}", HYP_VERSION as f64 / 100.0),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Mbr;
    use crate::header::{Attribute, HeaderConfig};
    use tempfile::tempdir;

    fn bin_header(mbr: Mbr) -> BinHeader {
        let config = HeaderConfig::new(mbr, 1.0).bin_attribute(
            Attribute::new("Hypotheses", 0.0, 100.0, 1.0)
                .reserved(ReservedAttribute::HypothesisCount),
        );
        BinHeader::new(&config).unwrap()
    }

    fn small() -> BinHeader {
        bin_header(Mbr::new(0.0, 0.0, 4.0, 3.0))
    }

    #[test]
    fn test_create_and_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("survey.hyp");
        let header = small();
        {
            let mut hyp = HypFile::create(&path, &header, HypParams::default())?;
            let node = hyp.read_node(BinIndex::new(2, 3))?;
            assert_eq!(node.count, 0);
            assert_eq!(node.best, header.null_depth as f32);

            let mut first = Hypothesis::new(10.5, 0.25, 12, 0.3);
            let mut second = Hypothesis::new(11.0, 0.5, 3, 0.4);
            hyp.add_hypothesis(BinIndex::new(1, 1), &mut first)?;
            hyp.add_hypothesis(BinIndex::new(1, 1), &mut second)?;
            hyp.set_best(BinIndex::new(1, 1), 10.5)?;
            hyp.sync()?;
        }

        let mut hyp = HypFile::open(&path, &header, true)?;
        assert_eq!(hyp.endian(), Endian::Big);
        assert_eq!(hyp.params(), &HypParams::default());
        assert_eq!(hyp.attribute_refs().count, Some(0));
        assert_eq!(hyp.attribute_refs().std_dev, None);

        let node = hyp.read_node(BinIndex::new(1, 1))?;
        assert_eq!((node.best, node.count), (10.5, 2));
        let values: Vec<f32> = hyp
            .read_hypotheses(BinIndex::new(1, 1))?
            .iter()
            .map(|h| h.value)
            .collect();
        assert_eq!(values, vec![11.0, 10.5]);
        Ok(())
    }

    #[test]
    fn test_create_refuses_existing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("taken.hyp");
        std::fs::write(&path, b"x")?;
        assert!(matches!(
            HypFile::create(&path, &small(), HypParams::default()),
            Err(Error::FileExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_cleared_slots_are_reused() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("reuse.hyp");
        let mut hyp = HypFile::create(&path, &small(), HypParams::default())?;
        let a = BinIndex::new(0, 0);
        let b = BinIndex::new(2, 2);

        for i in 0..3 {
            hyp.add_hypothesis(a, &mut Hypothesis::new(i as f32, 0.1, 1, 0.1))?;
        }
        assert_eq!(hyp.clear_node(a)?, 3);
        assert_eq!(hyp.free_slots()?, 3);
        assert!(hyp.read_hypotheses(a)?.is_empty());

        let mut h = Hypothesis::new(7.0, 0.2, 4, 0.1);
        hyp.add_hypothesis(b, &mut h)?;
        assert_eq!(hyp.slot_count(), 3);
        assert_eq!(hyp.free_slots()?, 2);

        h.variance = 0.05;
        hyp.update_hypothesis(&h)?;
        assert_eq!(hyp.read_hypotheses(b)?[0].variance, 0.05);
        Ok(())
    }

    #[test]
    fn test_mistagged_endian_is_retried() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("mistagged.hyp");
        let header = small();
        {
            let mut hyp = HypFile::create(&path, &header, HypParams::default())?;
            hyp.add_hypothesis(BinIndex::new(0, 1), &mut Hypothesis::new(3.0, 0.1, 2, 0.2))?;
            hyp.sync()?;
        }
        let mut bytes = std::fs::read(&path)?;
        bytes[ASCII_SIZE..ASCII_SIZE + 2].copy_from_slice(&Endian::Little.tag_bytes());
        std::fs::write(&path, &bytes)?;

        let mut hyp = HypFile::open(&path, &header, false)?;
        assert_eq!(hyp.endian(), Endian::Big);
        assert_eq!(hyp.read_hypotheses(BinIndex::new(0, 1))?[0].value, 3.0);
        Ok(())
    }

    #[test]
    fn test_dimension_mismatch() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("other.hyp");
        HypFile::create(&path, &small(), HypParams::default())?;

        let larger = bin_header(Mbr::new(0.0, 0.0, 6.0, 5.0));
        assert!(matches!(
            HypFile::open(&path, &larger, false),
            Err(Error::GeometryMismatch {
                expected: (5, 6),
                found: (3, 4)
            })
        ));
        Ok(())
    }

    #[test]
    fn test_banner_versions() -> Result<()> {
        let dir = tempdir()?;
        let header = small();
        for (name, banner, ok) in [
            ("legacy.hyp", "PCube Library - Version 1.50", true),
            ("newer.hyp", "Hypothesis Library - Version 3.00", false),
        ] {
            let path = dir.path().join(name);
            HypFile::create(&path, &header, HypParams::default())?;
            let mut bytes = std::fs::read(&path)?;
            let mut patched = banner.as_bytes().to_vec();
            patched.resize(BANNER.len(), b' ');
            bytes[..BANNER.len()].copy_from_slice(&patched);
            std::fs::write(&path, &bytes)?;

            let result = HypFile::open(&path, &header, false);
            if ok {
                assert!(result.is_ok());
            } else {
                assert!(matches!(result, Err(Error::VersionMismatch { .. })));
            }
        }
        Ok(())
    }

    #[test]
    fn test_self_loop_detected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("loop.hyp");
        let mut hyp = HypFile::create(&path, &small(), HypParams::default())?;
        let index = BinIndex::new(1, 2);
        let slot = hyp.add_hypothesis(index, &mut Hypothesis::new(1.0, 0.1, 1, 0.1))?;
        hyp.set_next(slot, slot)?;
        assert!(matches!(
            hyp.read_hypotheses(index),
            Err(Error::ChainCycle { row: 1, col: 2, .. })
        ));
        Ok(())
    }
}
