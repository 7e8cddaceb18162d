//! Input-file list (`.lst`) and line-name list (`.lin`).
//!
//! Both are plain text, one entry per line, keyed by a number that depth
//! records store in a bit-limited field. Numbers are handed out densely from
//! zero and an existing entry is reused when the same name is added again.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::bitpack::max_value;
use crate::error::Result;
use crate::Error;

pub trait ListEntry: Sized {
    const TAG: &'static str;
    /// Field name reported when the number space is exhausted.
    const FIELD: &'static str;

    /// Identity of an entry; adding an entry with a known key reuses its number.
    type Key: PartialEq + ?Sized;

    fn key(&self) -> &Self::Key;

    fn format(&self) -> String;

    fn parse(fields: &str) -> Option<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    /// Data format identifier of the source file.
    pub kind: i16,
    pub deleted: bool,
}

impl ListEntry for InputFile {
    const TAG: &'static str = "FILE";
    const FIELD: &'static str = "file number";

    type Key = Path;

    fn key(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> String {
        format!("{} {} {}", self.kind, self.deleted as u8, self.path.display())
    }

    fn parse(fields: &str) -> Option<Self> {
        let mut parts = fields.splitn(3, ' ');
        let kind = parts.next()?.parse().ok()?;
        let deleted = parts.next()? == "1";
        let path = PathBuf::from(parts.next()?);
        Some(Self { path, kind, deleted })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub name: String,
}

impl ListEntry for Line {
    const TAG: &'static str = "LINE";
    const FIELD: &'static str = "line number";

    type Key = str;

    fn key(&self) -> &str {
        &self.name
    }

    fn format(&self) -> String {
        self.name.clone()
    }

    fn parse(fields: &str) -> Option<Self> {
        Some(Self {
            name: fields.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct ListFile<E> {
    path: PathBuf,
    entries: Vec<E>,
    bits: u8,
}

impl<E: ListEntry> ListFile<E> {
    /// Creates an empty list; an existing file is never overwritten.
    pub fn create(path: &Path, bits: u8) -> Result<Self> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::FileExists(path.into()),
                _ => Error::Open(path.into(), e),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            entries: Vec::new(),
            bits,
        })
    }

    pub fn open(path: &Path, bits: u8) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::Open(path.into(), e))?;
        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            let entry = parse_line::<E>(line, entries.len())
                .ok_or_else(|| Error::InvalidHeader(format!(
                    "{} line {}: {:?}",
                    path.display(),
                    i + 1,
                    line
                )))?;
            entries.push(entry);
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            bits,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, number: u32) -> Option<&E> {
        self.entries.get(number as usize)
    }

    pub fn find(&self, key: &E::Key) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.key() == key)
            .map(|i| i as u32)
    }

    /// Adds `entry`, or returns the number of an existing entry with the same key.
    pub fn add(&mut self, entry: E) -> Result<u32> {
        if let Some(number) = self.find(entry.key()) {
            return Ok(number);
        }
        let number = self.entries.len() as u64;
        if number > max_value(self.bits) {
            return Err(Error::Overflow {
                field: E::FIELD,
                value: number as i128,
                bits: self.bits,
            });
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Open(self.path.clone(), e))?;
        writeln!(file, "{}", format_line(&entry, number))?;
        file.sync_all()?;

        self.entries.push(entry);
        Ok(number as u32)
    }

    /// Applies `edit` to an entry and rewrites the list.
    pub fn update(&mut self, number: u32, edit: impl FnOnce(&mut E)) -> Result<()> {
        let entry = self.entries.get_mut(number as usize).ok_or_else(|| {
            Error::InvalidOperation(format!("no {} {}", E::FIELD, number))
        })?;
        edit(entry);
        self.rewrite()
    }

    fn rewrite(&self) -> Result<()> {
        let mut file = File::create(&self.path).map_err(|e| Error::Open(self.path.clone(), e))?;
        for (number, entry) in self.entries.iter().enumerate() {
            writeln!(file, "{}", format_line(entry, number as u64))?;
        }
        file.sync_all()?;
        Ok(())
    }
}

fn format_line<E: ListEntry>(entry: &E, number: u64) -> String {
    format!("{} {:05} {}", E::TAG, number, entry.format())
}

fn parse_line<E: ListEntry>(line: &str, expected: usize) -> Option<E> {
    let rest = line.strip_prefix(E::TAG)?.strip_prefix(' ')?;
    let (number, fields) = rest.split_once(' ')?;
    if number.parse::<usize>().ok()? != expected {
        return None;
    }
    E::parse(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn input(path: &str) -> InputFile {
        InputFile {
            path: PathBuf::from(path),
            kind: 3,
            deleted: false,
        }
    }

    #[test]
    fn test_add_and_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("survey.lst");
        {
            let mut list = ListFile::<InputFile>::create(&path, 12)?;
            assert_eq!(list.add(input("/data/line 001.all"))?, 0);
            assert_eq!(list.add(input("/data/line_002.all"))?, 1);
            assert_eq!(list.add(input("/data/line 001.all"))?, 0);
            list.update(1, |f| f.deleted = true)?;
        }

        let list = ListFile::<InputFile>::open(&path, 12)?;
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0), Some(&input("/data/line 001.all")));
        assert!(list.get(1).unwrap().deleted);
        assert_eq!(list.find(Path::new("/data/line_002.all")), Some(1));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_are_distinct() -> Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir()?;
        let mut list = ListFile::<InputFile>::create(&dir.path().join("raw.lst"), 12)?;
        let first = PathBuf::from(OsStr::from_bytes(b"/data/a\xff.all"));
        let second = PathBuf::from(OsStr::from_bytes(b"/data/b\xfe.all"));
        let a = list.add(InputFile { path: first.clone(), kind: 1, deleted: false })?;
        let b = list.add(InputFile { path: second, kind: 1, deleted: false })?;
        assert_ne!(a, b);
        assert_eq!(list.add(InputFile { path: first, kind: 1, deleted: false })?, a);
        assert_eq!(list.len(), 2);
        Ok(())
    }

    #[test]
    fn test_create_refuses_existing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("survey.lin");
        fs::write(&path, "")?;
        assert!(matches!(
            ListFile::<Line>::create(&path, 8),
            Err(Error::FileExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_number_space_exhausted() -> Result<()> {
        let dir = tempdir()?;
        let mut lines = ListFile::<Line>::create(&dir.path().join("t.lin"), 1)?;
        lines.add(Line { name: "a".into() })?;
        lines.add(Line { name: "b".into() })?;
        assert!(matches!(
            lines.add(Line { name: "c".into() }),
            Err(Error::Overflow { field: "line number", bits: 1, .. })
        ));
        assert_eq!(lines.len(), 2);
        Ok(())
    }

    #[test]
    fn test_corrupt_line_reported() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.lin");
        fs::write(&path, "LINE 00000 first\nLINE 00007 skipped\n")?;
        assert!(matches!(
            ListFile::<Line>::open(&path, 8),
            Err(Error::InvalidHeader(_))
        ));
        Ok(())
    }
}
