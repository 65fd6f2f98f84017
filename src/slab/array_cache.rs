//! Bounded LIFO object arrays.
//!
//! The same shape serves as a per-CPU front-end, a per-node shared array
//! and an alien staging array. Entries are object slot addresses; the
//! newest entry sits at the end.

use alloc::vec::Vec;

pub(crate) struct ArrayCache {
    entries: Vec<usize>,
    limit: usize,
    batchcount: usize,
    /// Set by every allocation; cleared by the reaper.
    pub touched: bool,
}

impl ArrayCache {
    pub fn new(limit: usize, batchcount: usize) -> Self {
        Self {
            entries: Vec::with_capacity(limit),
            limit,
            batchcount,
            touched: false,
        }
    }

    pub fn avail(&self) -> usize {
        self.entries.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn batchcount(&self) -> usize {
        self.batchcount
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    pub fn room(&self) -> usize {
        self.limit.saturating_sub(self.entries.len())
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.entries.pop()
    }

    /// Push an entry; the caller guarantees room.
    pub fn push(&mut self, objp: usize) {
        debug_assert!(!self.is_full());
        self.entries.push(objp);
    }

    /// Remove and return the `n` oldest entries.
    pub fn take_oldest(&mut self, n: usize) -> alloc::vec::Drain<'_, usize> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n)
    }

    /// Remove every entry.
    pub fn take_all(&mut self) -> alloc::vec::Drain<'_, usize> {
        self.entries.drain(..)
    }

    /// Move up to `max` of the newest entries of `from` onto `self`, bounded
    /// by the room left in `self`. Returns the number moved.
    pub fn transfer_from(&mut self, from: &mut ArrayCache, max: usize) -> usize {
        let nr = from.avail().min(max).min(self.room());
        if nr == 0 {
            return 0;
        }
        let start = from.avail() - nr;
        self.entries.extend(from.entries.drain(start..));
        self.touched = true;
        nr
    }

    pub fn contains(&self, objp: usize) -> bool {
        self.entries.contains(&objp)
    }
}
