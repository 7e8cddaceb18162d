//! Virtualized file access for the bin and index files.
//!
//! Every structure file is opened through a [`Backend`]. Two backends exist:
//! [`large::LargeFile`] uses the host's native 64-bit file offsets, and
//! [`huge::HugeFile`] splits one logical file across bounded-size segment
//! files. The backend is chosen at open time from the [`IoKind`] tag stored in
//! the structure's handle file, so files created under either convention stay
//! readable.

pub mod checkpoint;
pub mod huge;
pub mod large;

use std::fmt::Debug;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::Result;
use crate::Error;

/// Default maximum size of one huge-I/O segment (2 GiB minus one byte).
pub const DEFAULT_SEGMENT_SIZE: u64 = (1 << 31) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read only.
    Read,
    /// Existing file, read and write.
    ReadWrite,
    /// New file, truncating anything already there.
    Create,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Large,
    Huge,
}

impl IoKind {
    pub fn tag(self) -> &'static str {
        match self {
            IoKind::Large => "LARGE",
            IoKind::Huge => "HUGE",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag.trim() {
            "LARGE" => Ok(IoKind::Large),
            "HUGE" => Ok(IoKind::Huge),
            other => Err(Error::InvalidHeader(format!("unknown I/O type: {}", other))),
        }
    }

    /// Opens `path` with the backend selected by this tag.
    pub fn open(self, path: &Path, mode: OpenMode, max_segment: u64) -> Result<Box<dyn Backend>> {
        let backend: Box<dyn Backend> = match self {
            IoKind::Large => Box::new(
                large::LargeFile::open(path, mode).map_err(|e| Error::Open(path.into(), e))?,
            ),
            IoKind::Huge => Box::new(
                huge::HugeFile::open(path, mode, max_segment)
                    .map_err(|e| Error::Open(path.into(), e))?,
            ),
        };
        Ok(backend)
    }
}

/// Byte order of a binary file header, recorded on disk as a two-byte tag.
///
/// Files are written big-endian. Readers detect the order from the tag so
/// files produced on hosts that wrote native little-endian stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    pub const TAG: u16 = 0x0102;

    /// Order implied by the two stored tag bytes.
    pub fn from_tag(bytes: [u8; 2]) -> Option<Self> {
        match bytes {
            [0x01, 0x02] => Some(Endian::Big),
            [0x02, 0x01] => Some(Endian::Little),
            _ => None,
        }
    }

    pub fn tag_bytes(self) -> [u8; 2] {
        let mut buf = [0u8; 2];
        self.write_u16(&mut buf, Self::TAG);
        buf
    }

    pub fn opposite(self) -> Self {
        match self {
            Endian::Big => Endian::Little,
            Endian::Little => Endian::Big,
        }
    }

    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Big => BigEndian::read_u16(buf),
            Endian::Little => LittleEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Big => BigEndian::read_u32(buf),
            Endian::Little => LittleEndian::read_u32(buf),
        }
    }

    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Big => BigEndian::read_u64(buf),
            Endian::Little => LittleEndian::read_u64(buf),
        }
    }

    pub fn read_f32(self, buf: &[u8]) -> f32 {
        f32::from_bits(self.read_u32(buf))
    }

    pub fn read_f64(self, buf: &[u8]) -> f64 {
        f64::from_bits(self.read_u64(buf))
    }

    pub fn write_u16(self, buf: &mut [u8], value: u16) {
        match self {
            Endian::Big => BigEndian::write_u16(buf, value),
            Endian::Little => LittleEndian::write_u16(buf, value),
        }
    }

    pub fn write_u32(self, buf: &mut [u8], value: u32) {
        match self {
            Endian::Big => BigEndian::write_u32(buf, value),
            Endian::Little => LittleEndian::write_u32(buf, value),
        }
    }

    pub fn write_u64(self, buf: &mut [u8], value: u64) {
        match self {
            Endian::Big => BigEndian::write_u64(buf, value),
            Endian::Little => LittleEndian::write_u64(buf, value),
        }
    }

    pub fn write_f32(self, buf: &mut [u8], value: f32) {
        self.write_u32(buf, value.to_bits());
    }

    pub fn write_f64(self, buf: &mut [u8], value: f64) {
        self.write_u64(buf, value.to_bits());
    }
}

/// Seekable byte stream with 64-bit offsets.
pub trait Backend: Read + Write + Seek + Send + Debug {
    /// Logical length in bytes.
    fn len(&self) -> io::Result<u64>;

    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Flushes buffered data and forces it to stable storage.
    fn sync(&mut self) -> io::Result<()>;

    fn kind(&self) -> IoKind;

    /// Marks the end of an edit session. Plain backends only sync.
    fn commit(&mut self) -> io::Result<()> {
        self.sync()
    }

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn tell(&mut self) -> io::Result<u64> {
        self.stream_position()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }
}
