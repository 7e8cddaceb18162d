//! One logical file split across fixed-size segment files.
//!
//! Segment 0 is the base path itself; segment `n` is the base path with a
//! `.NNN` suffix appended. Every segment except the last is exactly
//! `max_segment` bytes long, so a logical offset maps to
//! `(offset / max_segment, offset % max_segment)`.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{Backend, IoKind, OpenMode};

#[derive(Debug)]
pub struct HugeFile {
    base: PathBuf,
    writable: bool,
    max_segment: u64,
    /// Physical length of each existing segment.
    segment_lens: Vec<u64>,
    /// The single segment currently held open.
    current: Option<(usize, File)>,
    /// Segments written since the last sync.
    unsynced: BTreeSet<usize>,
    pos: u64,
}

pub fn segment_path(base: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return base.to_path_buf();
    }
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{:03}", index));
    PathBuf::from(name)
}

impl HugeFile {
    pub fn open(base: &Path, mode: OpenMode, max_segment: u64) -> io::Result<Self> {
        if max_segment == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size must be non-zero",
            ));
        }

        let mut segment_lens = Vec::new();
        match mode {
            OpenMode::Create => {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(base)?;
                let mut index = 1;
                while segment_path(base, index).exists() {
                    fs::remove_file(segment_path(base, index))?;
                    index += 1;
                }
                segment_lens.push(0);
            }
            OpenMode::Read | OpenMode::ReadWrite => {
                segment_lens.push(fs::metadata(base)?.len());
                let mut index = 1;
                loop {
                    match fs::metadata(segment_path(base, index)) {
                        Ok(meta) => segment_lens.push(meta.len()),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                        Err(e) => return Err(e),
                    }
                    index += 1;
                }
            }
        }

        let mut file = Self {
            base: base.to_path_buf(),
            writable: mode.writable(),
            max_segment,
            segment_lens,
            current: None,
            unsynced: BTreeSet::new(),
            pos: 0,
        };
        // Fail early on permission problems rather than at first access.
        file.segment(0)?;
        Ok(file)
    }

    pub fn segment_count(&self) -> usize {
        self.segment_lens.len()
    }

    fn logical_len(&self) -> u64 {
        let last = self.segment_lens.len() - 1;
        last as u64 * self.max_segment + self.segment_lens[last]
    }

    /// Returns the open handle for segment `index`, closing whichever segment was open before.
    fn segment(&mut self, index: usize) -> io::Result<&mut File> {
        let reopen = !matches!(&self.current, Some((open, _)) if *open == index);
        if reopen {
            self.current = None;
            let path = segment_path(&self.base, index);
            let file = if self.writable {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?
            } else {
                OpenOptions::new().read(true).open(&path)?
            };
            self.current = Some((index, file));
        }
        match &mut self.current {
            Some((_, file)) => Ok(file),
            None => unreachable!("segment opened above"),
        }
    }

    /// Makes sure segments `0..=index` exist, padding earlier ones to full size.
    fn grow_to(&mut self, index: usize) -> io::Result<()> {
        while self.segment_lens.len() <= index {
            let last = self.segment_lens.len() - 1;
            if self.segment_lens[last] < self.max_segment {
                let max = self.max_segment;
                self.segment(last)?.set_len(max)?;
                self.segment_lens[last] = max;
                self.unsynced.insert(last);
            }
            self.segment_lens.push(0);
            self.segment(last + 1)?;
        }
        Ok(())
    }
}

impl Read for HugeFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.logical_len();
        if buf.is_empty() || self.pos >= len {
            return Ok(0);
        }

        let index = (self.pos / self.max_segment) as usize;
        let offset = self.pos % self.max_segment;
        let want = (buf.len() as u64)
            .min(self.max_segment - offset)
            .min(len - self.pos) as usize;

        let file = self.segment(index)?;
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for HugeFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let index = (self.pos / self.max_segment) as usize;
        let offset = self.pos % self.max_segment;
        let want = (buf.len() as u64).min(self.max_segment - offset) as usize;

        self.grow_to(index)?;
        let file = self.segment(index)?;
        file.seek(SeekFrom::Start(offset))?;
        let n = file.write(&buf[..want])?;

        let end = offset + n as u64;
        if end > self.segment_lens[index] {
            self.segment_lens[index] = end;
        }
        self.unsynced.insert(index);
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.current {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Seek for HugeFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.logical_len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(offset) => {
                self.pos = offset;
                Ok(offset)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

impl Backend for HugeFile {
    fn len(&self) -> io::Result<u64> {
        Ok(self.logical_len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let needed = if len == 0 {
            1
        } else {
            len.div_ceil(self.max_segment) as usize
        };

        if needed > self.segment_lens.len() {
            self.grow_to(needed - 1)?;
        }
        while self.segment_lens.len() > needed {
            let last = self.segment_lens.len() - 1;
            if matches!(&self.current, Some((open, _)) if *open == last) {
                self.current = None;
            }
            fs::remove_file(segment_path(&self.base, last))?;
            self.segment_lens.pop();
            self.unsynced.remove(&last);
        }

        let last = needed - 1;
        let last_len = len - last as u64 * self.max_segment;
        self.segment(last)?.set_len(last_len)?;
        self.segment_lens[last] = last_len;
        self.unsynced.insert(last);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        let pending: Vec<usize> = self.unsynced.iter().copied().collect();
        for index in pending {
            self.segment(index)?.sync_all()?;
        }
        self.unsynced.clear();
        Ok(())
    }

    fn kind(&self) -> IoKind {
        IoKind::Huge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_spanning_boundary_is_split() -> io::Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("split.ndx");
        let mut file = HugeFile::open(&base, OpenMode::Create, 10)?;

        let payload: Vec<u8> = (0..25u8).collect();
        file.write_at(5, &payload)?;

        assert_eq!(file.segment_count(), 3);
        assert_eq!(file.len()?, 30);
        assert_eq!(fs::metadata(segment_path(&base, 0))?.len(), 10);
        assert_eq!(fs::metadata(segment_path(&base, 1))?.len(), 10);
        assert_eq!(fs::metadata(segment_path(&base, 2))?.len(), 10);

        let mut back = vec![0u8; 25];
        file.read_at(5, &mut back)?;
        assert_eq!(back, payload);
        Ok(())
    }

    #[test]
    fn test_reopen_discovers_segments() -> io::Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("reopen.bin");
        {
            let mut file = HugeFile::open(&base, OpenMode::Create, 8)?;
            file.write_all(b"0123456789abcdefXYZ")?;
            file.sync()?;
        }

        let mut file = HugeFile::open(&base, OpenMode::Read, 8)?;
        assert_eq!(file.len()?, 19);
        let mut all = Vec::new();
        file.read_to_end(&mut all)?;
        assert_eq!(all, b"0123456789abcdefXYZ");
        Ok(())
    }

    #[test]
    fn test_sparse_write_pads_earlier_segments() -> io::Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("sparse.bin");
        let mut file = HugeFile::open(&base, OpenMode::Create, 4)?;

        file.write_at(13, b"!")?;
        assert_eq!(file.len()?, 14);

        let mut zeros = [9u8; 13];
        file.read_at(0, &mut zeros)?;
        assert!(zeros.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_truncate_removes_trailing_segments() -> io::Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("trunc.bin");
        let mut file = HugeFile::open(&base, OpenMode::Create, 4)?;
        file.write_all(&[7u8; 14])?;

        file.set_len(5)?;
        assert_eq!(file.len()?, 5);
        assert_eq!(file.segment_count(), 2);
        assert!(!segment_path(&base, 2).exists());
        assert!(!segment_path(&base, 3).exists());

        file.set_len(0)?;
        assert_eq!(file.len()?, 0);
        assert_eq!(file.segment_count(), 1);
        Ok(())
    }

    #[test]
    fn test_create_removes_stale_segments() -> io::Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("stale.bin");
        {
            let mut file = HugeFile::open(&base, OpenMode::Create, 4)?;
            file.write_all(&[1u8; 12])?;
        }
        let file = HugeFile::open(&base, OpenMode::Create, 4)?;
        assert_eq!(file.len()?, 0);
        assert!(!segment_path(&base, 1).exists());
        Ok(())
    }

    #[test]
    fn test_seek_before_start_fails() -> io::Result<()> {
        let dir = tempdir()?;
        let mut file = HugeFile::open(&dir.path().join("seek.bin"), OpenMode::Create, 4)?;
        assert!(file.seek(SeekFrom::Current(-1)).is_err());
        assert_eq!(file.seek(SeekFrom::End(0))?, 0);
        Ok(())
    }
}
