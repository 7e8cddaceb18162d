//! An open PFM structure.
//!
//! A structure is addressed by its handle file `<name>.pfm`, a tagged text
//! file naming the companion files kept in `<name>.pfm.data/`:
//!
//! ```text
//! <name>.pfm            handle file
//! <name>.pfm.lock       advisory writer lock (opt in)
//! <name>.pfm.data/
//!     <name>.bin        header block, bin records, coverage map
//!     <name>.ndx        depth record slots
//!     <name>.lst        input file list
//!     <name>.lin        line names
//! ```
//!
//! With checkpointing enabled the bin and index files each get a
//! `<file>.chk` journal for the length of the session; see
//! [`crate::io::checkpoint`].

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::bin::{BinRecord, BinStore};
use crate::cache::{BinCache, CellStore};
use crate::config::{CacheConfig, PfmConfig};
use crate::depth::{DepthRecord, DepthStore};
use crate::error::Result;
use crate::flock::FileLock;
use crate::geometry::{BinIndex, Coord};
use crate::header::tags::{TagWriter, Tags};
use crate::header::{BinHeader, HeaderConfig, VERSION_STRING};
use crate::io::checkpoint::{self, journal_path, CheckpointFile};
use crate::io::{Backend, IoKind, OpenMode};
use crate::list::{InputFile, Line, ListFile};
use crate::recompute::{recompute, RecomputeMask};
use crate::validity::Validity;
use crate::Error;

const HANDLE_BANNER: &str = "PFM Handle File";

/// Bin header, bin records and depth chains: everything the cache sits on.
#[derive(Debug)]
struct Store {
    header: BinHeader,
    bins: BinStore,
    depths: DepthStore,
}

impl CellStore for Store {
    fn load(&mut self, index: BinIndex) -> Result<(BinRecord, Vec<DepthRecord>)> {
        let bin = self.bins.read(index)?;
        let chain = self.depths.read_chain(&bin)?;
        Ok((bin, chain))
    }

    fn save(&mut self, bin: &BinRecord, chain: &[DepthRecord]) -> Result<()> {
        for record in chain.iter().filter(|r| r.address.is_some()) {
            self.depths.update(record)?;
        }
        self.bins.write(&mut self.header.stats, bin)
    }
}

#[derive(Debug)]
struct Lists {
    files: ListFile<InputFile>,
    lines: ListFile<Line>,
}

/// Paths of every file belonging to one structure.
#[derive(Debug, Clone)]
struct Layout {
    handle: PathBuf,
    data_dir: PathBuf,
    bin: PathBuf,
    index: PathBuf,
    list: PathBuf,
    line: PathBuf,
}

impl Layout {
    fn new(handle: &Path) -> Result<Self> {
        let stem = handle
            .file_stem()
            .ok_or_else(|| Error::InvalidConfig(format!("no file name in {}", handle.display())))?
            .to_os_string();
        let data_dir = suffixed(handle, ".data");
        let file = |ext: &str| {
            let mut name = stem.clone();
            name.push(ext);
            data_dir.join(name)
        };
        Ok(Self {
            handle: handle.to_path_buf(),
            bin: file(".bin"),
            index: file(".ndx"),
            list: file(".lst"),
            line: file(".lin"),
            data_dir,
        })
    }

    fn lock(&self) -> PathBuf {
        suffixed(&self.handle, ".lock")
    }

    fn files(&self) -> [&Path; 5] {
        [&self.handle, &self.bin, &self.index, &self.list, &self.line]
    }

    /// Stores a companion path relative to the handle file's directory.
    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        match self.handle.parent() {
            Some(dir) => path.strip_prefix(dir).unwrap_or(path),
            None => path,
        }
    }

    fn resolve(&self, stored: &str) -> PathBuf {
        let stored = Path::new(stored);
        match self.handle.parent() {
            Some(dir) if stored.is_relative() => dir.join(stored),
            _ => stored.to_path_buf(),
        }
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug)]
pub struct Pfm {
    layout: Layout,
    config: PfmConfig,
    store: Store,
    lists: Lists,
    cache: Option<BinCache>,
    lock: Option<FileLock>,
    last_error: i32,
}

impl Pfm {
    /// Creates a new structure at `path` and opens it with `config`.
    ///
    /// Fails with [`Error::FileExists`] if the handle file or any companion
    /// file is already present.
    pub fn create(path: impl AsRef<Path>, header: &HeaderConfig, config: PfmConfig) -> Result<Self> {
        let layout = Layout::new(path.as_ref())?;
        let header = BinHeader::new(header)?;
        for file in layout.files() {
            if file.exists() {
                return Err(Error::FileExists(file.to_path_buf()));
            }
        }
        fs::create_dir_all(&layout.data_dir)?;

        let mut w = TagWriter::new();
        w.line(&format!("{} - {}", HANDLE_BANNER, VERSION_STRING))
            .put("BIN FILE", layout.relative(&layout.bin).display())
            .put("INDEX FILE", layout.relative(&layout.index).display())
            .put("LIST FILE", layout.relative(&layout.list).display())
            .put("LINE FILE", layout.relative(&layout.line).display())
            .put("IO TYPE", config.io_kind.tag())
            .put("MAX SEGMENT SIZE", config.max_segment_size);
        let mut handle = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&layout.handle)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::FileExists(layout.handle.clone()),
                _ => Error::Open(layout.handle.clone(), e),
            })?;
        handle.write_all(w.finish().as_bytes())?;
        handle.sync_all()?;

        ListFile::<InputFile>::create(&layout.list, header.file_number_bits)?;
        ListFile::<Line>::create(&layout.line, header.line_number_bits)?;

        let kind = config.io_kind;
        let segment = config.max_segment_size;
        let bin_file = kind.open(&layout.bin, OpenMode::Create, segment)?;
        BinStore::create(bin_file, &header)?;
        let index_file = kind.open(&layout.index, OpenMode::Create, segment)?;
        DepthStore::create(index_file, &header)?;

        tracing::info!(
            path = %layout.handle.display(),
            width = header.grid.width,
            height = header.grid.height,
            io = kind.tag(),
            "Created PFM structure"
        );
        Self::open(&layout.handle, config)
    }

    /// Opens an existing structure.
    pub fn open(path: impl AsRef<Path>, config: PfmConfig) -> Result<Self> {
        let layout = Layout::new(path.as_ref())?;
        let text = fs::read_to_string(&layout.handle)
            .map_err(|e| Error::Open(layout.handle.clone(), e))?;
        let tags = Tags::parse(&text);
        if !tags.banner().iter().any(|l| l.starts_with(HANDLE_BANNER)) {
            return Err(Error::InvalidHeader(format!(
                "{} is not a PFM handle file",
                layout.handle.display()
            )));
        }
        let bin = layout.resolve(&tags.require::<String>("BIN FILE")?);
        let index = layout.resolve(&tags.require::<String>("INDEX FILE")?);
        let list = layout.resolve(&tags.require::<String>("LIST FILE")?);
        let line = layout.resolve(&tags.require::<String>("LINE FILE")?);
        let layout = Layout {
            bin,
            index,
            list,
            line,
            ..layout
        };
        let kind = IoKind::from_tag(&tags.require::<String>("IO TYPE")?)?;
        let segment = tags.require::<u64>("MAX SEGMENT SIZE")?;

        let writable = !config.read_only;
        let lock = if config.exclusive_lock && writable {
            Some(FileLock::lock(layout.lock()).map_err(Error::LockError)?)
        } else {
            None
        };

        let mut bin_file = open_backend(&layout.bin, kind, segment, &config)?;
        let header = BinHeader::read(bin_file.as_mut())?;
        let bins = BinStore::open(bin_file, &header)?;
        let index_file = open_backend(&layout.index, kind, segment, &config)?;
        let depths = DepthStore::open(index_file, &header)?;

        let lists = Lists {
            files: ListFile::open(&layout.list, header.file_number_bits)?,
            lines: ListFile::open(&layout.line, header.line_number_bits)?,
        };

        tracing::info!(
            path = %layout.handle.display(),
            version = %header.version,
            read_only = config.read_only,
            checkpoint = config.checkpoint,
            "Opened PFM structure"
        );
        Ok(Self {
            cache: config.cache.map(BinCache::new),
            layout,
            config,
            store: Store {
                header,
                bins,
                depths,
            },
            lists,
            lock,
            last_error: 0,
        })
    }

    /// Flushes the cache and header, then ends the edit session.
    ///
    /// Dropping a handle without closing it leaves any checkpoint journals in
    /// place, so the next open treats the session as interrupted.
    pub fn close(mut self) -> Result<()> {
        if !self.config.read_only {
            self.flush()?;
            self.store.bins.commit()?;
            self.store.depths.commit()?;
        }
        tracing::info!(path = %self.layout.handle.display(), "Closed PFM structure");
        drop(self.lock.take());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.layout.handle
    }

    pub fn config(&self) -> &PfmConfig {
        &self.config
    }

    pub fn header(&self) -> &BinHeader {
        &self.store.header
    }

    /// Mutable header access; changes reach disk on [`Pfm::write_header`], flush or close.
    pub fn header_mut(&mut self) -> &mut BinHeader {
        &mut self.store.header
    }

    /// Code of the most recent failed call on this handle, 0 if none failed.
    pub fn last_error(&self) -> i32 {
        self.last_error
    }

    fn track<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        if let Err(err) = &result {
            self.last_error = err.code();
        }
        result
    }

    fn writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::InvalidOperation(format!(
                "{} is open read-only",
                self.layout.handle.display()
            )));
        }
        Ok(())
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.track(|pfm| {
            pfm.writable()?;
            pfm.store.header.validate()?;
            pfm.store.bins.write_header(&pfm.store.header)
        })
    }

    /// Writes every dirty cached cell and the header, then syncs both files.
    pub fn flush(&mut self) -> Result<()> {
        self.track(|pfm| {
            pfm.writable()?;
            if let Some(cache) = pfm.cache.as_mut() {
                cache.flush_all(&mut pfm.store)?;
            }
            pfm.store.bins.write_header(&pfm.store.header)?;
            pfm.store.bins.sync()?;
            pfm.store.depths.sync()?;
            Ok(())
        })
    }

    /// Enables the cell cache or changes its window and capacity.
    pub fn configure_cache(&mut self, config: CacheConfig) -> Result<()> {
        self.track(|pfm| {
            match pfm.cache.as_mut() {
                Some(cache) => cache.configure(config, &mut pfm.store)?,
                None => pfm.cache = Some(BinCache::new(config)),
            }
            pfm.config.cache = Some(config);
            Ok(())
        })
    }

    /// Flushes and drops the cell cache; later calls go straight to disk.
    pub fn disable_cache(&mut self) -> Result<()> {
        self.track(|pfm| {
            if let Some(mut cache) = pfm.cache.take() {
                if let Err(err) = cache.destroy(&mut pfm.store) {
                    pfm.cache = Some(cache);
                    return Err(err);
                }
            }
            pfm.config.cache = None;
            Ok(())
        })
    }

    pub fn bin_index(&self, coord: Coord) -> Result<BinIndex> {
        self.store.header.grid.index(coord)
    }

    pub fn bin_center(&self, index: BinIndex) -> Result<Coord> {
        self.store.header.grid.center(index)
    }

    pub fn bin_inside(&self, coord: Coord) -> bool {
        self.store.header.grid.contains(coord)
    }

    fn load_cell(&mut self, index: BinIndex) -> Result<(BinRecord, Vec<DepthRecord>)> {
        match self.cache.as_mut() {
            Some(cache) => {
                let cell = cache.get(index, &mut self.store)?;
                Ok((cell.bin.clone(), cell.chain.clone()))
            }
            None => self.store.load(index),
        }
    }

    /// Stores a modified cell and returns the bin as stored. Without a cache
    /// only the bin record is written; chain records have already been
    /// written by the caller.
    fn store_cell(&mut self, bin: BinRecord, chain: Vec<DepthRecord>) -> Result<BinRecord> {
        let bin = self.store.bins.normalize(&bin)?;
        match self.cache.as_mut() {
            Some(cache) => cache.put(bin.clone(), chain, &mut self.store)?,
            None => self.store.bins.write(&mut self.store.header.stats, &bin)?,
        }
        Ok(bin)
    }

    pub fn read_bin(&mut self, index: BinIndex) -> Result<BinRecord> {
        self.track(|pfm| match pfm.cache.as_mut() {
            Some(cache) => Ok(cache.get(index, &mut pfm.store)?.bin.clone()),
            None => pfm.store.bins.read(index),
        })
    }

    pub fn read_bin_by_coord(&mut self, coord: Coord) -> Result<BinRecord> {
        let index = self.track(|pfm| pfm.bin_index(coord))?;
        self.read_bin(index)
    }

    /// Validity bits of one bin without decoding the rest of the record.
    pub fn read_bin_validity(&mut self, index: BinIndex) -> Result<Validity> {
        self.track(|pfm| {
            if let Some(cache) = pfm.cache.as_mut() {
                if cache.contains(index) {
                    return Ok(cache.get(index, &mut pfm.store)?.bin.validity);
                }
            }
            pfm.store.bins.read_validity(index)
        })
    }

    /// Writes a bin record, folding its ranges into the header statistics.
    pub fn write_bin(&mut self, bin: &BinRecord) -> Result<()> {
        self.track(|pfm| {
            pfm.writable()?;
            match pfm.cache.as_mut() {
                Some(cache) => {
                    let stored = pfm.store.bins.normalize(bin)?;
                    let chain = cache.get(bin.index, &mut pfm.store)?.chain.clone();
                    cache.put(stored, chain, &mut pfm.store)
                }
                None => pfm.store.bins.write(&mut pfm.store.header.stats, bin),
            }
        })
    }

    /// Appends a sounding to the chain of the bin containing `record.coord`.
    ///
    /// Sets `record.bin` and `record.address`. The bin's aggregates are not
    /// recomputed; call [`Pfm::recompute`] once a batch is loaded.
    pub fn add_depth_record(&mut self, record: &mut DepthRecord) -> Result<u64> {
        self.track(|pfm| {
            pfm.writable()?;
            let index = pfm.bin_index(record.coord)?;
            record.bin = index;
            if record.attributes.is_empty() {
                record.attributes = pfm
                    .store
                    .header
                    .ndx_attributes
                    .iter()
                    .map(|a| a.spec.min)
                    .collect();
            }
            let (mut bin, mut chain) = pfm.load_cell(index)?;
            let slot = pfm.store.depths.append(&mut bin, record)?;
            chain.push(pfm.store.depths.normalize(record)?);
            pfm.store_cell(bin, chain)?;
            Ok(slot)
        })
    }

    /// Every depth record of a bin, in insertion order.
    pub fn read_chain(&mut self, index: BinIndex) -> Result<Vec<DepthRecord>> {
        self.track(|pfm| Ok(pfm.load_cell(index)?.1))
    }

    pub fn read_chain_by_coord(&mut self, coord: Coord) -> Result<Vec<DepthRecord>> {
        let index = self.track(|pfm| pfm.bin_index(coord))?;
        self.read_chain(index)
    }

    /// Rewrites a record obtained from [`Pfm::read_chain`] in its own slot.
    pub fn update_depth_record(&mut self, record: &DepthRecord) -> Result<()> {
        self.track(|pfm| pfm.update_record(record, false))
    }

    /// Rewrites only the validity bits of a record obtained from [`Pfm::read_chain`].
    pub fn update_depth_validity(&mut self, record: &DepthRecord) -> Result<()> {
        self.track(|pfm| pfm.update_record(record, true))
    }

    fn update_record(&mut self, record: &DepthRecord, validity_only: bool) -> Result<()> {
        self.writable()?;
        let Some(cache) = self.cache.as_mut() else {
            return if validity_only {
                self.store.depths.update_validity(record)
            } else {
                self.store.depths.update(record)
            };
        };

        let stored = if validity_only {
            None
        } else {
            Some(self.store.depths.normalize(record)?)
        };
        let cell = cache.get(record.bin, &mut self.store)?;
        let (bin, mut chain) = (cell.bin.clone(), cell.chain.clone());
        let cached = chain
            .iter_mut()
            .find(|r| r.address.is_some() && r.address == record.address)
            .ok_or_else(|| {
                Error::ChainMismatch(format!(
                    "slot {:?} is not in the chain of bin ({}, {})",
                    record.address, record.bin.row, record.bin.col
                ))
            })?;
        match stored {
            Some(stored) => *cached = stored,
            None => cached.validity = record.validity,
        }
        cache.put(bin, chain, &mut self.store)
    }

    /// Recalculates a bin's aggregates from its chain, or from `records` when given.
    pub fn recompute(
        &mut self,
        index: BinIndex,
        mask: RecomputeMask,
        records: Option<&[DepthRecord]>,
    ) -> Result<BinRecord> {
        self.track(|pfm| pfm.recompute_bin(index, mask, records))
    }

    fn recompute_bin(
        &mut self,
        index: BinIndex,
        mask: RecomputeMask,
        records: Option<&[DepthRecord]>,
    ) -> Result<BinRecord> {
        self.writable()?;
        let (mut bin, chain) = match (records, self.cache.is_some()) {
            (Some(_), false) => (self.store.bins.read(index)?, Vec::new()),
            _ => self.load_cell(index)?,
        };
        recompute(
            &self.store.header,
            &mut bin,
            records.unwrap_or(chain.as_slice()),
            mask,
        );
        self.store_cell(bin, chain)
    }

    /// Recomputes every bin, reporting each whole percent completed to `progress`.
    pub fn recompute_all(&mut self, mask: RecomputeMask, mut progress: impl FnMut(u32)) -> Result<()> {
        self.track(|pfm| {
            let grid = pfm.store.header.grid;
            let total = grid.bin_count().max(1);
            let mut done = 0u64;
            let mut reported = 0u32;
            for row in 0..grid.height {
                for col in 0..grid.width {
                    pfm.recompute_bin(BinIndex::new(row, col), mask, None)?;
                    done += 1;
                    let percent = (done * 100 / total) as u32;
                    if percent > reported {
                        reported = percent;
                        progress(percent);
                    }
                }
            }
            pfm.store.bins.write_header(&pfm.store.header)?;
            tracing::info!(bins = done, "Recomputed all bins");
            Ok(())
        })
    }

    /// Unlinks deleted soundings from a bin's chain and frees their slots.
    pub fn purge_bin(&mut self, index: BinIndex) -> Result<u64> {
        self.track(|pfm| {
            pfm.writable()?;
            if let Some(cache) = pfm.cache.as_mut() {
                cache.flush(index, &mut pfm.store)?;
                cache.invalidate(index);
            }
            let mut bin = pfm.store.bins.read(index)?;
            let removed = pfm.store.depths.purge(&mut bin)?;
            if removed > 0 {
                pfm.store.bins.write(&mut pfm.store.header.stats, &bin)?;
            }
            Ok(removed)
        })
    }

    /// Replaces a bin's checked/verified flags with `flags`.
    pub fn set_bin_flags(&mut self, index: BinIndex, flags: Validity) -> Result<()> {
        self.track(|pfm| {
            pfm.writable()?;
            if flags.intersects(!Validity::BIN_ONLY) {
                return Err(Error::InvalidOperation(format!(
                    "{:?} is not a bin-level flag",
                    flags & !Validity::BIN_ONLY
                )));
            }
            let (mut bin, chain) = pfm.load_cell(index)?;
            bin.validity.remove(Validity::BIN_ONLY);
            bin.validity.insert(flags);
            pfm.store_cell(bin, chain)?;
            Ok(())
        })
    }

    pub fn read_coverage(&mut self, index: BinIndex) -> Result<u8> {
        self.track(|pfm| pfm.store.bins.read_coverage(index))
    }

    pub fn write_coverage(&mut self, index: BinIndex, flags: u8) -> Result<()> {
        self.track(|pfm| {
            pfm.writable()?;
            pfm.store.bins.write_coverage(index, flags)
        })
    }

    /// Registers an input file and returns its number; a known path keeps its number.
    pub fn add_input_file(&mut self, path: impl Into<PathBuf>, kind: i16) -> Result<u32> {
        let entry = InputFile {
            path: path.into(),
            kind,
            deleted: false,
        };
        self.track(|pfm| {
            pfm.writable()?;
            pfm.lists.files.add(entry)
        })
    }

    pub fn input_file(&self, number: u32) -> Option<&InputFile> {
        self.lists.files.get(number)
    }

    pub fn input_file_count(&self) -> usize {
        self.lists.files.len()
    }

    pub fn set_input_file_deleted(&mut self, number: u32, deleted: bool) -> Result<()> {
        self.track(|pfm| {
            pfm.writable()?;
            pfm.lists.files.update(number, |f| f.deleted = deleted)
        })
    }

    /// Registers a line name and returns its number; a known name keeps its number.
    pub fn add_line(&mut self, name: impl Into<String>) -> Result<u32> {
        let entry = Line { name: name.into() };
        self.track(|pfm| {
            pfm.writable()?;
            pfm.lists.lines.add(entry)
        })
    }

    pub fn line_name(&self, number: u32) -> Option<&str> {
        self.lists.lines.get(number).map(|l| l.name.as_str())
    }

    /// Released index slots waiting for reuse.
    pub fn free_depth_slots(&mut self) -> Result<u64> {
        self.track(|pfm| pfm.store.depths.free_slots())
    }

    pub fn cache_stats(&self) -> Option<(usize, usize)> {
        self.cache.as_ref().map(BinCache::stats)
    }
}

/// Opens one structure file, recovering or journaling it as `config` asks.
fn open_backend(path: &Path, kind: IoKind, segment: u64, config: &PfmConfig) -> Result<Box<dyn Backend>> {
    let journal = journal_path(path);
    let mode = if config.read_only {
        OpenMode::Read
    } else {
        OpenMode::ReadWrite
    };

    if journal.exists() {
        if !config.recover || config.read_only {
            return Err(Error::CheckpointRecoveryRequired(journal));
        }
        let mut file = kind.open(path, OpenMode::ReadWrite, segment)?;
        checkpoint::recover(&journal, file.as_mut())?;
    }

    let file = kind.open(path, mode, segment)?;
    if config.checkpoint && !config.read_only {
        return Ok(Box::new(CheckpointFile::new(file, &journal)?));
    }
    Ok(file)
}
