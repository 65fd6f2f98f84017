//! Slab caches.
//!
//! This module provides the object caches and their building blocks:
//! - Slab geometry selection
//! - Slab descriptors with index-linked free lists
//! - Per-node full/partial/empty lists with shared and alien arrays
//! - Per-CPU front-ends
//! - The page-to-slab reverse map

mod array_cache;
mod debug;
mod geometry;
mod node_lists;
mod page_map;
mod slab_cache;
mod slab_list;
mod slab_node;
mod stats;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

pub use debug::CorruptionKind;
pub(crate) use geometry::{GeometryLimits, Tunables};
pub use geometry::SlabGeometry;
pub(crate) use page_map::PageMap;
pub use slab_cache::SlabCache;
pub use stats::{CacheStats, StatsSnapshot};

use crate::{CpuId, CpuTopology, NodeId, PageBacking};

bitflags::bitflags! {
    /// Creation flags of a cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SlabFlags: u32 {
        /// Align objects to hardware cache lines, halving the alignment
        /// for objects small enough to share a line
        const HWCACHE_ALIGN = 1 << 0;
        /// Objects are reclaimable; accept the first viable slab order
        const RECLAIM_ACCOUNT = 1 << 1;
        /// Keep slab descriptors off-slab even for small objects
        const OFF_SLAB = 1 << 2;
        /// Hold the pages of destroyed slabs until a grace period completes
        const DESTROY_BY_RCU = 1 << 3;
        /// Guard words around each object (debug builds)
        const RED_ZONE = 1 << 4;
        /// Poison free objects (debug builds)
        const POISON = 1 << 5;
        /// Keep statistics
        const STATS = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Per-request allocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Never fall back to another node
        const THIS_NODE = 1 << 0;
        /// Zero the object before returning it
        const ZERO = 1 << 1;
    }
}

/// State shared by the registry and all of its caches.
pub(crate) struct SlabEnv<const PAGE_SIZE: usize> {
    pub backing: Arc<dyn PageBacking>,
    pub topology: Arc<dyn CpuTopology>,
    pub page_map: PageMap<PAGE_SIZE>,
    pub limits: GeometryLimits,
    pub max_cpus: usize,
    pub nodes: usize,
    pub use_alien_caches: bool,
    pub node_reap_interval_ms: u64,
    pub stats: bool,
    /// Registered cpus per node
    pub node_cpus: alloc::boxed::Box<[AtomicUsize]>,
    pub active_cpus: AtomicUsize,
}

impl<const PAGE_SIZE: usize> SlabEnv<PAGE_SIZE> {
    pub fn cpus_on_node(&self, node: NodeId) -> usize {
        self.node_cpus
            .get(node)
            .map_or(0, |n| n.load(Ordering::Relaxed))
    }

    pub fn active_cpus(&self) -> usize {
        self.active_cpus.load(Ordering::Relaxed)
    }

    /// Node of `cpu`; unknown nodes map to node 0.
    pub fn node_of(&self, cpu: CpuId) -> NodeId {
        let node = self.topology.cpu_node(cpu);
        if node < self.nodes {
            node
        } else {
            0
        }
    }

    pub fn current(&self) -> (CpuId, NodeId) {
        let cpu = self.topology.current_cpu();
        (cpu, self.node_of(cpu))
    }
}

/// Occupancy of one node of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub node: NodeId,
    pub full_slabs: usize,
    pub partial_slabs: usize,
    pub empty_slabs: usize,
    pub free_objects: usize,
    pub free_limit: usize,
    pub shared_avail: usize,
    pub shared_limit: usize,
    /// Objects staged in this node's alien arrays, all remote nodes summed
    pub alien_avail: usize,
}

/// Read-only snapshot of a cache for reporting tools.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub name: String,
    pub object_size: usize,
    pub buffer_size: usize,
    pub active_objects: usize,
    pub total_objects: usize,
    pub active_slabs: usize,
    pub total_slabs: usize,
    pub objects_per_slab: usize,
    pub pages_per_slab: usize,
    pub limit: usize,
    pub batch: usize,
    pub shared: usize,
    /// Slabs waiting for a grace period before release
    pub deferred_slabs: usize,
    pub nodes: Vec<NodeInfo>,
    pub stats: Option<StatsSnapshot>,
}
