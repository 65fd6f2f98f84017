//! Single-node buddy zone
//!
//! Implements the buddy system for one NUMA node. A node may own several
//! disjoint memory regions; free blocks of each order are kept in sorted
//! sets so buddies can be located and merged in logarithmic time.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::{AllocError, AllocResult, NodeId};

#[cfg(feature = "log")]
use log::{error, warn};

/// Largest block order a zone manages (`2^20` pages).
pub const MAX_BUDDY_ORDER: usize = 20;

/// A contiguous region handed to the zone by `add_memory`.
#[derive(Debug, Clone, Copy)]
struct Region {
    start: usize,
    end: usize,
}

/// Buddy allocator for the memory of one node.
pub struct BuddyZone<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    node: NodeId,
    regions: Vec<Region>,
    total_pages: usize,
    free_pages: usize,
    /// Free block addresses for each order
    free_lists: [BTreeSet<usize>; MAX_BUDDY_ORDER + 1],
}

impl<const PAGE_SIZE: usize> BuddyZone<PAGE_SIZE> {
    /// Create an empty zone for `node`
    pub const fn new(node: NodeId) -> Self {
        Self {
            node,
            regions: Vec::new(),
            total_pages: 0,
            free_pages: 0,
            free_lists: [const { BTreeSet::new() }; MAX_BUDDY_ORDER + 1],
        }
    }

    pub const fn node(&self) -> NodeId {
        self.node
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn used_pages(&self) -> usize {
        self.total_pages - self.free_pages
    }

    pub fn available_pages(&self) -> usize {
        self.free_pages
    }

    /// Number of free blocks held at `order`
    pub fn free_blocks(&self, order: usize) -> usize {
        self.free_lists.get(order).map_or(0, BTreeSet::len)
    }

    /// Check if an address belongs to this zone
    pub fn contains(&self, addr: usize) -> bool {
        self.regions
            .iter()
            .any(|r| addr >= r.start && addr < r.end)
    }

    fn region_of(&self, addr: usize) -> Option<Region> {
        self.regions
            .iter()
            .copied()
            .find(|r| addr >= r.start && addr < r.end)
    }

    /// Whether `[start, end)` intersects memory already managed by this zone.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.regions.iter().any(|r| start < r.end && r.start < end)
    }

    /// Add a free memory region. The region is trimmed to page boundaries
    /// and carved into the largest naturally aligned blocks it contains.
    pub fn add_memory(&mut self, start: usize, size: usize) -> AllocResult {
        let start_aligned = crate::align_up(start, PAGE_SIZE);
        let end_aligned = crate::align_down(start.saturating_add(size), PAGE_SIZE);
        if end_aligned <= start_aligned {
            return Err(AllocError::InvalidParam);
        }
        if self.overlaps(start_aligned, end_aligned) {
            error!(
                "node {}: region [{:#x}, {:#x}) overlaps existing memory",
                self.node, start_aligned, end_aligned
            );
            return Err(AllocError::MemoryOverlap);
        }

        self.regions.push(Region {
            start: start_aligned,
            end: end_aligned,
        });

        let mut addr = start_aligned;
        while addr < end_aligned {
            let mut order = MAX_BUDDY_ORDER;
            while order > 0
                && (!crate::is_aligned(addr, PAGE_SIZE << order)
                    || addr + (PAGE_SIZE << order) > end_aligned)
            {
                order -= 1;
            }
            self.free_lists[order].insert(addr);
            addr += PAGE_SIZE << order;
        }

        let pages = (end_aligned - start_aligned) / PAGE_SIZE;
        self.total_pages += pages;
        self.free_pages += pages;
        Ok(())
    }

    /// Allocate a block of `2^order` pages aligned to its own size.
    pub fn alloc(&mut self, order: usize) -> AllocResult<usize> {
        if order > MAX_BUDDY_ORDER {
            return Err(AllocError::InvalidParam);
        }

        let found = (order..=MAX_BUDDY_ORDER).find(|&o| !self.free_lists[o].is_empty());
        let Some(mut current) = found else {
            return Err(AllocError::NoMemory);
        };
        let addr = self.free_lists[current]
            .pop_first()
            .ok_or(AllocError::NoMemory)?;

        // Split down, returning upper halves to the free lists
        while current > order {
            current -= 1;
            self.free_lists[current].insert(addr + (PAGE_SIZE << current));
        }

        self.free_pages -= 1 << order;
        Ok(addr)
    }

    /// Free a block previously returned by [`alloc`](Self::alloc), merging it
    /// with its buddy as long as the buddy is free.
    pub fn dealloc(&mut self, addr: usize, order: usize) -> AllocResult {
        if order > MAX_BUDDY_ORDER || !crate::is_aligned(addr, PAGE_SIZE << order) {
            error!(
                "node {}: bad free of {:#x} at order {}",
                self.node, addr, order
            );
            return Err(AllocError::InvalidParam);
        }
        let Some(region) = self.region_of(addr) else {
            error!("node {}: address {:#x} not in zone", self.node, addr);
            return Err(AllocError::NotAllocated);
        };
        if self.is_free(addr, order) {
            warn!(
                "node {}: double free detected at {:#x} (order {})",
                self.node, addr, order
            );
            return Err(AllocError::NotAllocated);
        }

        let mut block = addr;
        let mut current = order;
        while current < MAX_BUDDY_ORDER {
            let buddy = block ^ (PAGE_SIZE << current);
            if buddy < region.start
                || buddy + (PAGE_SIZE << current) > region.end
                || !self.free_lists[current].remove(&buddy)
            {
                break;
            }
            block &= buddy;
            current += 1;
        }
        self.free_lists[current].insert(block);
        self.free_pages += 1 << order;
        Ok(())
    }

    /// Whether any part of the block is already on a free list.
    fn is_free(&self, addr: usize, order: usize) -> bool {
        let end = addr + (PAGE_SIZE << order);
        // Descendants: free sub-blocks inside the range
        let inner = (0..=order).any(|o| self.free_lists[o].range(addr..end).next().is_some());
        // Ancestors: a larger free block covering the range
        inner
            || (order + 1..=MAX_BUDDY_ORDER).any(|o| {
                let base = crate::align_down(addr, PAGE_SIZE << o);
                self.free_lists[o].contains(&base)
            })
    }
}
