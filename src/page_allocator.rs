//! NUMA page backing built from per-node buddy zones.

use alloc::vec::Vec;

use kspin::SpinNoIrq;

use crate::buddy::{BuddyZone, MAX_BUDDY_ORDER};
use crate::{AllocError, AllocResult, NodeId, PageBacking, PageRange};

#[cfg(feature = "log")]
use log::{debug, warn};

/// Page allocator with one buddy zone per memory node.
///
/// Each zone sits behind its own lock, so growth on different nodes never
/// contends.
pub struct NumaPageAllocator<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    zones: Vec<SpinNoIrq<BuddyZone<PAGE_SIZE>>>,
}

impl<const PAGE_SIZE: usize> NumaPageAllocator<PAGE_SIZE> {
    /// Create an allocator for `nodes` memory nodes, all initially empty.
    pub fn new(nodes: usize) -> Self {
        let nodes = nodes.max(1);
        Self {
            zones: (0..nodes)
                .map(|node| SpinNoIrq::new(BuddyZone::new(node)))
                .collect(),
        }
    }

    /// Hand the region `[start, start + size)` to `node`.
    pub fn add_memory(&self, node: NodeId, start: usize, size: usize) -> AllocResult {
        let zone = self.zones.get(node).ok_or(AllocError::InvalidParam)?;
        let end = start.saturating_add(size);
        for (other, z) in self.zones.iter().enumerate() {
            if other != node && z.lock().overlaps(start, end) {
                warn!(
                    "region [{:#x}, {:#x}) already belongs to node {}",
                    start, end, other
                );
                return Err(AllocError::MemoryOverlap);
            }
        }
        zone.lock().add_memory(start, size)?;
        debug!(
            "node {}: added {} pages at {:#x}",
            node,
            size / PAGE_SIZE,
            start
        );
        Ok(())
    }

    pub fn total_pages(&self) -> usize {
        self.zones.iter().map(|z| z.lock().total_pages()).sum()
    }

    pub fn used_pages(&self) -> usize {
        self.zones.iter().map(|z| z.lock().used_pages()).sum()
    }

    pub fn available_pages(&self) -> usize {
        self.zones.iter().map(|z| z.lock().available_pages()).sum()
    }

    /// Pages still free on `node`, or 0 for an unknown node
    pub fn node_available_pages(&self, node: NodeId) -> usize {
        self.zones
            .get(node)
            .map_or(0, |z| z.lock().available_pages())
    }

    /// Pages handed out from `node`, or 0 for an unknown node
    pub fn node_used_pages(&self, node: NodeId) -> usize {
        self.zones.get(node).map_or(0, |z| z.lock().used_pages())
    }

    fn alloc_on(&self, node: NodeId, order: usize) -> AllocResult<PageRange> {
        let zone = self.zones.get(node).ok_or(AllocError::InvalidParam)?;
        let base = zone.lock().alloc(order)?;
        Ok(PageRange { base, order, node })
    }
}

impl<const PAGE_SIZE: usize> PageBacking for NumaPageAllocator<PAGE_SIZE> {
    fn acquire_pages(&self, order: usize, node: Option<NodeId>) -> AllocResult<PageRange> {
        if order > MAX_BUDDY_ORDER {
            return Err(AllocError::InvalidParam);
        }
        match node {
            Some(node) => self.alloc_on(node, order),
            None => (0..self.zones.len())
                .find_map(|node| self.alloc_on(node, order).ok())
                .ok_or(AllocError::NoMemory),
        }
    }

    fn release_pages(&self, base: usize, order: usize) -> AllocResult {
        for zone in &self.zones {
            let mut zone = zone.lock();
            if zone.contains(base) {
                return zone.dealloc(base, order);
            }
        }
        warn!("release of foreign pages at {:#x}", base);
        Err(AllocError::NotAllocated)
    }

    fn node_count(&self) -> usize {
        self.zones.len()
    }
}
