use std::{
    cmp::min,
    collections::{HashMap, VecDeque},
};

use crate::bin::BinRecord;
use crate::config::CacheConfig;
use crate::depth::DepthRecord;
use crate::error::Result;
use crate::geometry::BinIndex;

/// Maximum frequency limit for a cell in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

/// Backing storage the cache reads cells from and writes dirty cells to.
pub trait CellStore {
    fn load(&mut self, index: BinIndex) -> Result<(BinRecord, Vec<DepthRecord>)>;

    fn save(&mut self, bin: &BinRecord, chain: &[DepthRecord]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Clean,
    Dirty,
}

/// A bin record together with its depth chain.
#[derive(Debug, Clone)]
pub struct Cell {
    pub bin: BinRecord,
    pub chain: Vec<DepthRecord>,
    state: CellState,
    freq: u8,
}

impl Cell {
    fn new(bin: BinRecord, chain: Vec<DepthRecord>, state: CellState) -> Self {
        Cell {
            bin,
            chain,
            state,
            freq: 0,
        }
    }

    pub fn state(&self) -> CellState {
        self.state
    }
}

/// Write-back cache of bin cells for one handle.
///
/// Eviction prefers cells outside the row/column window around the most
/// recently touched bin, then falls back to a second-chance FIFO. Dirty cells
/// are flushed before they leave the cache.
#[derive(Debug)]
pub struct BinCache {
    config: CacheConfig,
    /// insertion order, front is the next eviction candidate
    queue: VecDeque<BinIndex>,
    cells: HashMap<BinIndex, Cell>,
    focus: Option<BinIndex>,
    stats: Stats,
}

impl BinCache {
    pub fn new(config: CacheConfig) -> Self {
        BinCache {
            config,
            queue: VecDeque::new(),
            cells: HashMap::new(),
            focus: None,
            stats: Stats::default(),
        }
    }

    /// Changes the window and capacity, evicting down to the new size.
    pub fn configure<S: CellStore + ?Sized>(&mut self, config: CacheConfig, store: &mut S) -> Result<()> {
        self.config = config;
        while self.cells.len() > self.capacity() {
            self.evict(store)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn capacity(&self) -> usize {
        self.config.max_cells.max(1)
    }

    /// Returns the cell for `index`, loading it from `store` on a miss.
    pub fn get<S: CellStore + ?Sized>(&mut self, index: BinIndex, store: &mut S) -> Result<&Cell> {
        self.focus = Some(index);
        if let Some(cell) = self.cells.get_mut(&index) {
            cell.freq = min(cell.freq + 1, MAX_FREQUENCY_LIMIT);
            self.stats.hit();
        } else {
            self.stats.miss();
            let (bin, chain) = store.load(index)?;
            self.insert(index, Cell::new(bin, chain, CellState::Clean), store)?;
        }
        Ok(&self.cells[&index])
    }

    /// Replaces the cached contents of a cell and marks it dirty.
    pub fn put<S: CellStore + ?Sized>(
        &mut self,
        bin: BinRecord,
        chain: Vec<DepthRecord>,
        store: &mut S,
    ) -> Result<()> {
        let index = bin.index;
        self.focus = Some(index);
        match self.cells.get_mut(&index) {
            Some(cell) => {
                cell.bin = bin;
                cell.chain = chain;
                cell.state = CellState::Dirty;
                cell.freq = min(cell.freq + 1, MAX_FREQUENCY_LIMIT);
            }
            None => self.insert(index, Cell::new(bin, chain, CellState::Dirty), store)?,
        }
        Ok(())
    }

    pub fn contains(&self, index: BinIndex) -> bool {
        self.cells.contains_key(&index)
    }

    pub fn state(&self, index: BinIndex) -> Option<CellState> {
        self.cells.get(&index).map(Cell::state)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Drops a clean cell so the next read goes back to the store.
    pub fn invalidate(&mut self, index: BinIndex) -> bool {
        match self.cells.get(&index) {
            Some(cell) if cell.state == CellState::Clean => {
                self.cells.remove(&index);
                self.queue.retain(|i| *i != index);
                true
            }
            _ => false,
        }
    }

    /// Writes one dirty cell. On failure the cell stays dirty.
    pub fn flush<S: CellStore + ?Sized>(&mut self, index: BinIndex, store: &mut S) -> Result<()> {
        if let Some(cell) = self.cells.get_mut(&index) {
            if cell.state == CellState::Dirty {
                store.save(&cell.bin, &cell.chain)?;
                cell.state = CellState::Clean;
            }
        }
        Ok(())
    }

    /// Writes every dirty cell in row-major order, stopping at the first failure.
    pub fn flush_all<S: CellStore + ?Sized>(&mut self, store: &mut S) -> Result<()> {
        let mut dirty: Vec<BinIndex> = self
            .cells
            .iter()
            .filter(|(_, cell)| cell.state == CellState::Dirty)
            .map(|(index, _)| *index)
            .collect();
        dirty.sort();
        for index in &dirty {
            self.flush(*index, store)?;
        }
        if !dirty.is_empty() {
            tracing::debug!(cells = dirty.len(), "Flushed dirty bin cells");
        }
        Ok(())
    }

    /// Flushes everything, then empties the cache.
    pub fn destroy<S: CellStore + ?Sized>(&mut self, store: &mut S) -> Result<()> {
        self.flush_all(store)?;
        self.cells.clear();
        self.queue.clear();
        self.focus = None;
        Ok(())
    }

    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn insert<S: CellStore + ?Sized>(&mut self, index: BinIndex, cell: Cell, store: &mut S) -> Result<()> {
        while self.cells.len() >= self.capacity() {
            self.evict(store)?;
        }
        self.cells.insert(index, cell);
        self.queue.push_back(index);
        Ok(())
    }

    fn in_window(&self, index: BinIndex) -> bool {
        match self.focus {
            Some(focus) => {
                index.row.abs_diff(focus.row) <= self.config.row_span
                    && index.col.abs_diff(focus.col) <= self.config.col_span
            }
            None => false,
        }
    }

    fn evict<S: CellStore + ?Sized>(&mut self, store: &mut S) -> Result<()> {
        while let Some(index) = self.queue.pop_front() {
            let in_window = self.in_window(index);
            let Some(cell) = self.cells.get_mut(&index) else {
                continue;
            };
            if in_window && cell.freq > 0 {
                cell.freq -= 1;
                self.queue.push_back(index);
                continue;
            }

            if cell.state == CellState::Dirty {
                if let Err(err) = store.save(&cell.bin, &cell.chain) {
                    self.queue.push_front(index);
                    return Err(err);
                }
                cell.state = CellState::Clean;
            }
            self.cells.remove(&index);
            tracing::debug!(row = index.row, col = index.col, "Evicted bin cell");
            return Ok(());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Stats {
    hits: usize,
    misses: usize,
}

impl Stats {
    fn hit(&mut self) {
        self.hits += 1;
    }

    fn miss(&mut self) {
        self.misses += 1;
    }

    fn get(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }
}
