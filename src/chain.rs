//! Slot arenas shared by the index file and the hypothesis file.
//!
//! Both files store fixed-size records in a flat array of slots addressed by a
//! 1-based index, with 0 meaning "no slot". Records link to each other through
//! a continuation slot index. Released slots are threaded onto a free list
//! that reuses the same continuation field.

use std::collections::HashSet;

use crate::error::Result;
use crate::Error;

/// Terminates chains and the free list.
pub const NULL_SLOT: u64 = 0;

/// Access to the continuation field of each slot in an arena.
pub trait SlotLinks {
    /// Number of slots currently allocated.
    fn slot_count(&self) -> u64;

    fn next(&mut self, slot: u64) -> Result<u64>;

    fn set_next(&mut self, slot: u64, next: u64) -> Result<()>;
}

/// Walks a chain and fails on out-of-range pointers and revisited slots.
#[derive(Debug)]
pub struct ChainGuard {
    limit: u64,
    row: u32,
    col: u32,
    visited: HashSet<u64>,
}

impl ChainGuard {
    pub fn new(limit: u64, row: u32, col: u32) -> Self {
        Self {
            limit,
            row,
            col,
            visited: HashSet::new(),
        }
    }

    pub fn visit(&mut self, slot: u64) -> Result<()> {
        if slot == NULL_SLOT || slot > self.limit {
            return Err(Error::ChainMismatch(format!(
                "bin ({}, {}) links to slot {} outside 1..={}",
                self.row, self.col, slot, self.limit
            )));
        }
        if !self.visited.insert(slot) {
            return Err(Error::ChainCycle {
                row: self.row,
                col: self.col,
                slot,
            });
        }
        Ok(())
    }

    pub fn visited(&self) -> usize {
        self.visited.len()
    }
}

/// Intrusive free list of released slots, rooted in the owning file's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeList {
    head: u64,
}

impl FreeList {
    pub fn new(head: u64) -> Self {
        Self { head }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == NULL_SLOT
    }

    /// Takes the most recently released slot, if any.
    pub fn pop<L: SlotLinks + ?Sized>(&mut self, links: &mut L) -> Result<Option<u64>> {
        if self.is_empty() {
            return Ok(None);
        }
        let slot = self.head;
        if slot > links.slot_count() {
            return Err(Error::ChainMismatch(format!(
                "free list head {} beyond {} slots",
                slot,
                links.slot_count()
            )));
        }
        self.head = links.next(slot)?;
        links.set_next(slot, NULL_SLOT)?;
        Ok(Some(slot))
    }

    pub fn push<L: SlotLinks + ?Sized>(&mut self, links: &mut L, slot: u64) -> Result<()> {
        links.set_next(slot, self.head)?;
        self.head = slot;
        Ok(())
    }

    /// Number of free slots, failing on a corrupt list.
    pub fn len<L: SlotLinks + ?Sized>(&self, links: &mut L) -> Result<u64> {
        let mut guard = ChainGuard::new(links.slot_count(), u32::MAX, u32::MAX);
        let mut slot = self.head;
        while slot != NULL_SLOT {
            guard.visit(slot)?;
            slot = links.next(slot)?;
        }
        Ok(guard.visited() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Slots {
        next: Vec<u64>,
    }

    impl SlotLinks for Slots {
        fn slot_count(&self) -> u64 {
            self.next.len() as u64
        }

        fn next(&mut self, slot: u64) -> Result<u64> {
            Ok(self.next[slot as usize - 1])
        }

        fn set_next(&mut self, slot: u64, next: u64) -> Result<()> {
            self.next[slot as usize - 1] = next;
            Ok(())
        }
    }

    #[test]
    fn test_free_list_is_lifo() -> Result<()> {
        let mut slots = Slots { next: vec![0; 5] };
        let mut free = FreeList::default();

        free.push(&mut slots, 2)?;
        free.push(&mut slots, 4)?;
        assert_eq!(free.len(&mut slots)?, 2);

        assert_eq!(free.pop(&mut slots)?, Some(4));
        assert_eq!(free.pop(&mut slots)?, Some(2));
        assert_eq!(free.pop(&mut slots)?, None);
        assert!(free.is_empty());
        Ok(())
    }

    #[test]
    fn test_guard_detects_cycle() {
        let mut guard = ChainGuard::new(10, 1, 2);
        guard.visit(3).unwrap();
        guard.visit(7).unwrap();
        assert!(matches!(
            guard.visit(3),
            Err(Error::ChainCycle { row: 1, col: 2, slot: 3 })
        ));
    }

    #[test]
    fn test_guard_rejects_out_of_range() {
        let mut guard = ChainGuard::new(4, 0, 0);
        assert!(matches!(guard.visit(5), Err(Error::ChainMismatch(_))));
        assert!(matches!(guard.visit(0), Err(Error::ChainMismatch(_))));
    }

    #[test]
    fn test_corrupt_free_list_reported() {
        let mut slots = Slots { next: vec![1, 0] };
        let free = FreeList::new(1);
        assert!(matches!(
            free.len(&mut slots),
            Err(Error::ChainCycle { .. })
        ));
    }
}
