use crate::io::{IoKind, DEFAULT_SEGMENT_SIZE};

/// Configuration for opening or creating a structure
#[derive(Debug, Clone)]
pub struct PfmConfig {
    /// Backend used for the bin and index files of a new structure (default: Large).
    /// Existing structures always use the kind recorded in their handle file.
    pub io_kind: IoKind,

    /// Maximum size of one huge-I/O segment (default: 2GB - 1)
    pub max_segment_size: u64,

    /// Open without write access (default: false)
    pub read_only: bool,

    /// Journal original blocks so an interrupted session can be rolled back (default: false)
    pub checkpoint: bool,

    /// Roll back a leftover journal at open instead of failing (default: false)
    pub recover: bool,

    /// Take an advisory writer lock on `<name>.pfm.lock` (default: false)
    pub exclusive_lock: bool,

    /// Bin cell cache; `None` sends every call straight to disk (default: None)
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Rows either side of the most recent bin kept in preference to others (default: 8)
    pub row_span: u32,

    /// Columns either side of the most recent bin kept in preference to others (default: 8)
    pub col_span: u32,

    /// Maximum number of cached cells (default: 1024)
    pub max_cells: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            row_span: 8,
            col_span: 8,
            max_cells: 1024,
        }
    }
}

impl CacheConfig {
    pub fn new(row_span: u32, col_span: u32, max_cells: usize) -> Self {
        Self {
            row_span,
            col_span,
            max_cells,
        }
    }
}

impl Default for PfmConfig {
    fn default() -> Self {
        Self {
            io_kind: IoKind::Large,
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            read_only: false,
            checkpoint: false,
            recover: false,
            exclusive_lock: false,
            cache: None,
        }
    }
}

impl PfmConfig {
    /// Set the backend for new structures
    pub fn io_kind(mut self, kind: IoKind) -> Self {
        self.io_kind = kind;
        self
    }

    /// Set the huge-I/O segment size
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enable the checkpoint journal
    pub fn checkpoint(mut self, enabled: bool) -> Self {
        self.checkpoint = enabled;
        self
    }

    /// Recover from a leftover journal at open
    pub fn recover(mut self, enabled: bool) -> Self {
        self.recover = enabled;
        self
    }

    pub fn exclusive_lock(mut self, enabled: bool) -> Self {
        self.exclusive_lock = enabled;
        self
    }

    /// Configure the bin cell cache
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PfmConfig::default();
        assert_eq!(config.io_kind, IoKind::Large);
        assert_eq!(config.max_segment_size, DEFAULT_SEGMENT_SIZE);
        assert!(!config.read_only);
        assert!(!config.checkpoint);
        assert!(!config.exclusive_lock);
        assert!(config.cache.is_none());

        let cache = CacheConfig::default();
        assert_eq!((cache.row_span, cache.col_span, cache.max_cells), (8, 8, 1024));
    }

    #[test]
    fn test_config_builder() {
        let config = PfmConfig::default()
            .io_kind(IoKind::Huge)
            .max_segment_size(1 << 20)
            .checkpoint(true)
            .recover(true)
            .exclusive_lock(true)
            .cache(CacheConfig::new(2, 3, 64));

        assert_eq!(config.io_kind, IoKind::Huge);
        assert_eq!(config.max_segment_size, 1 << 20);
        assert!(config.checkpoint && config.recover && config.exclusive_lock);
        assert_eq!(config.cache, Some(CacheConfig::new(2, 3, 64)));
    }
}
