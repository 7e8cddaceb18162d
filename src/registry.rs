use std::path::Path;

use crate::config::PfmConfig;
use crate::error::Result;
use crate::header::HeaderConfig;
use crate::pfm::Pfm;
use crate::Error;

/// Default number of structures one registry holds open at once.
pub const MAX_OPEN: usize = 128;

/// Small integer naming an open structure within one [`PfmRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PfmHandle(usize);

impl PfmHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Bounded table of open structures, addressed by [`PfmHandle`].
#[derive(Debug)]
pub struct PfmRegistry {
    slots: Vec<Option<Pfm>>,
}

impl Default for PfmRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_OPEN)
    }
}

impl PfmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of open structures.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn free_slot(&self) -> Result<usize> {
        self.slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyHandles)
    }

    fn insert(&mut self, slot: usize, pfm: Pfm) -> PfmHandle {
        self.slots[slot] = Some(pfm);
        PfmHandle(slot)
    }

    pub fn create(
        &mut self,
        path: impl AsRef<Path>,
        header: &HeaderConfig,
        config: PfmConfig,
    ) -> Result<PfmHandle> {
        let slot = self.free_slot()?;
        let pfm = Pfm::create(path, header, config)?;
        Ok(self.insert(slot, pfm))
    }

    pub fn open(&mut self, path: impl AsRef<Path>, config: PfmConfig) -> Result<PfmHandle> {
        let slot = self.free_slot()?;
        let pfm = Pfm::open(path, config)?;
        Ok(self.insert(slot, pfm))
    }

    pub fn get(&self, handle: PfmHandle) -> Result<&Pfm> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidHandle(handle.0))
    }

    pub fn get_mut(&mut self, handle: PfmHandle) -> Result<&mut Pfm> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidHandle(handle.0))
    }

    /// Closes a structure and frees its slot. The slot is freed even if closing fails.
    pub fn close(&mut self, handle: PfmHandle) -> Result<()> {
        let pfm = self
            .slots
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or(Error::InvalidHandle(handle.0))?;
        pfm.close()
    }

    /// Closes every open structure, returning the first failure.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first = None;
        for pfm in self.slots.iter_mut().filter_map(Option::take) {
            if let Err(err) = pfm.close() {
                tracing::warn!(error = %err, "Failed to close PFM structure");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BinIndex, Mbr};
    use tempfile::tempdir;

    fn header() -> HeaderConfig {
        HeaderConfig::new(Mbr::new(0.0, 0.0, 4.0, 4.0), 1.0)
    }

    #[test]
    fn test_handles_address_independent_structures() -> Result<()> {
        let dir = tempdir()?;
        let mut registry = PfmRegistry::new();
        assert_eq!(registry.capacity(), MAX_OPEN);

        let a = registry.create(dir.path().join("a.pfm"), &header(), PfmConfig::default())?;
        let b = registry.create(dir.path().join("b.pfm"), &header(), PfmConfig::default())?;
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        let mut record = crate::depth::DepthRecord::new(crate::geometry::Coord::new(1.5, 1.5), 3.0);
        registry.get_mut(a)?.add_depth_record(&mut record)?;
        assert_eq!(registry.get_mut(a)?.read_chain(BinIndex::new(1, 1))?.len(), 1);
        assert!(registry.get_mut(b)?.read_chain(BinIndex::new(1, 1))?.is_empty());

        registry.close(a)?;
        assert!(matches!(registry.get(a), Err(Error::InvalidHandle(_))));
        assert!(matches!(registry.close(a), Err(Error::InvalidHandle(_))));

        let again = registry.open(dir.path().join("a.pfm"), PfmConfig::default())?;
        assert_eq!(again, a);
        registry.close_all()?;
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn test_full_registry() -> Result<()> {
        let dir = tempdir()?;
        let mut registry = PfmRegistry::with_capacity(1);
        registry.create(dir.path().join("one.pfm"), &header(), PfmConfig::default())?;

        let err = registry
            .create(dir.path().join("two.pfm"), &header(), PfmConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::TooManyHandles));
        // Nothing was created for the refused request.
        assert!(!dir.path().join("two.pfm").exists());
        assert!(matches!(
            registry.get(PfmHandle(7)),
            Err(Error::InvalidHandle(7))
        ));
        Ok(())
    }
}
