//! Undo journal protecting the original contents of a structure file during an edit session.
//!
//! Before any block of the file's original content is overwritten for the
//! first time, the block is appended to `<file>.chk`. A clean close removes
//! the journal; a journal found at open time means the previous session
//! never finished and the file must be rolled back with [`recover`].

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{Backend, IoKind};
use crate::checksum::Checksum;
use crate::error::Result;
use crate::Error;

pub const JOURNAL_HEADER_SIZE: usize = 30;
const JOURNAL_MAGIC: u32 = 0x43_48_4B; // ASCII "CHK"
const JOURNAL_VERSION: u16 = 1;
pub const BLOCK_SIZE: u64 = 4096;

pub fn journal_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".chk");
    PathBuf::from(name)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JournalHeader {
    pub magic: u32,
    pub version: u16,
    pub original_len: u64,
    pub entry_count: u64,
    pub checksum: u64,
}

impl JournalHeader {
    pub fn new(original_len: u64) -> Self {
        Self {
            magic: JOURNAL_MAGIC,
            version: JOURNAL_VERSION,
            original_len,
            entry_count: 0,
            checksum: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(JOURNAL_HEADER_SIZE);
        buf.write_u32::<BigEndian>(self.magic)?;
        buf.write_u16::<BigEndian>(self.version)?;
        buf.write_u64::<BigEndian>(self.original_len)?;
        buf.write_u64::<BigEndian>(self.entry_count)?;
        buf.write_u64::<BigEndian>(self.checksum)?;
        Ok(buf)
    }

    pub fn decode<R: Read>(mut reader: R) -> Result<Self> {
        let truncated = |_| Error::CheckpointUnrecoverable("truncated journal header".into());
        let header = Self {
            magic: reader.read_u32::<BigEndian>().map_err(truncated)?,
            version: reader.read_u16::<BigEndian>().map_err(truncated)?,
            original_len: reader.read_u64::<BigEndian>().map_err(truncated)?,
            entry_count: reader.read_u64::<BigEndian>().map_err(truncated)?,
            checksum: reader.read_u64::<BigEndian>().map_err(truncated)?,
        };
        if header.magic != JOURNAL_MAGIC {
            return Err(Error::CheckpointUnrecoverable("bad journal magic".into()));
        }
        if header.version != JOURNAL_VERSION {
            return Err(Error::CheckpointUnrecoverable(format!(
                "unsupported journal version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

#[derive(Debug)]
pub struct Journal {
    file: File,
    header: JournalHeader,
    checksum: Checksum,
    path: PathBuf,
}

impl Journal {
    /// Starts a new journal; fails if one is already present.
    pub fn create(path: &Path, original_len: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::CheckpointRecoveryRequired(path.into()),
                _ => Error::Open(path.into(), e),
            })?;

        let header = JournalHeader::new(original_len);
        file.write_all(&header.encode()?)?;
        file.sync_all()?;

        Ok(Self {
            file,
            header,
            checksum: Checksum::new(),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    /// Durably records the original bytes found at `offset`.
    pub fn append(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut entry = Vec::with_capacity(12 + bytes.len());
        entry.write_u64::<BigEndian>(offset)?;
        entry.write_u32::<BigEndian>(bytes.len() as u32)?;
        entry.extend_from_slice(bytes);

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&entry)?;

        self.checksum.write(&entry);
        self.header.entry_count += 1;
        self.header.checksum = self.checksum.value();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode()?)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Ends the session: the journal is no longer needed.
    pub fn discard(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Rolls `target` back to the state captured in the journal at `path`, then removes the journal.
///
/// Returns the number of blocks restored.
pub fn recover(path: &Path, target: &mut dyn Backend) -> Result<u64> {
    let file = File::open(path).map_err(|e| Error::Open(path.into(), e))?;
    let mut reader = BufReader::new(file);
    let header = JournalHeader::decode(&mut reader)?;

    let mut checksum = Checksum::new();
    let mut entries = Vec::new();
    for _ in 0..header.entry_count {
        let entry = read_entry(&mut reader).map_err(|e| {
            Error::CheckpointUnrecoverable(format!("truncated journal entry: {}", e))
        })?;
        let mut raw = Vec::with_capacity(12 + entry.1.len());
        raw.write_u64::<BigEndian>(entry.0)?;
        raw.write_u32::<BigEndian>(entry.1.len() as u32)?;
        raw.extend_from_slice(&entry.1);
        checksum.write(&raw);
        entries.push(entry);
    }

    if checksum.value() != header.checksum {
        return Err(Error::CheckpointUnrecoverable(format!(
            "checksum mismatch: computed = {}, stored = {}",
            checksum.value(),
            header.checksum
        )));
    }

    for (offset, bytes) in &entries {
        target.write_at(*offset, bytes)?;
    }
    target.set_len(header.original_len)?;
    target.sync()?;

    fs::remove_file(path)?;
    tracing::info!(
        journal = %path.display(),
        blocks = entries.len(),
        "Rolled back unfinished edit session"
    );
    Ok(entries.len() as u64)
}

fn read_entry<R: Read>(reader: &mut R) -> io::Result<(u64, Vec<u8>)> {
    let offset = reader.read_u64::<BigEndian>()?;
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok((offset, bytes))
}

/// Backend wrapper that journals original blocks before they are overwritten.
#[derive(Debug)]
pub struct CheckpointFile {
    inner: Box<dyn Backend>,
    /// `None` once the session has been committed.
    journal: Option<Journal>,
    saved: HashSet<u64>,
}

impl CheckpointFile {
    pub fn new(inner: Box<dyn Backend>, journal_path: &Path) -> Result<Self> {
        let original_len = inner.len()?;
        let journal = Journal::create(journal_path, original_len)?;
        Ok(Self {
            inner,
            journal: Some(journal),
            saved: HashSet::new(),
        })
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    fn save_range(&mut self, start: u64, end: u64) -> io::Result<()> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        let original_len = journal.header().original_len;
        let end = end.min(original_len);
        if start >= end {
            return Ok(());
        }

        let resume = self.inner.stream_position()?;
        for block in start / BLOCK_SIZE..end.div_ceil(BLOCK_SIZE) {
            if self.saved.contains(&block) {
                continue;
            }
            let offset = block * BLOCK_SIZE;
            let len = BLOCK_SIZE.min(original_len - offset) as usize;
            let mut bytes = vec![0u8; len];
            self.inner.read_at(offset, &mut bytes)?;
            journal
                .append(offset, &bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.saved.insert(block);
        }
        self.inner.seek(SeekFrom::Start(resume))?;
        Ok(())
    }
}

impl Read for CheckpointFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for CheckpointFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let start = self.inner.stream_position()?;
        self.save_range(start, start + buf.len() as u64)?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for CheckpointFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl Backend for CheckpointFile {
    fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if let Some(original_len) = self.journal.as_ref().map(|j| j.header().original_len) {
            self.save_range(len, original_len)?;
        }
        self.inner.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }

    /// Syncs the file, then deletes the journal: the edit session is complete.
    fn commit(&mut self) -> io::Result<()> {
        self.inner.sync()?;
        if let Some(journal) = self.journal.take() {
            journal
                .discard()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }
        Ok(())
    }

    fn kind(&self) -> IoKind {
        self.inner.kind()
    }
}
