//! NUMA-aware slab object allocator
//!
//! This crate serves fixed-size object allocations out of page-granularity
//! memory, featuring:
//! - Slab caches with coloring and on-slab or off-slab free-list metadata
//! - Per-CPU LIFO front-ends refilled and flushed in batches
//! - Per-node slab lists with shared and alien staging arrays
//! - NUMA fallback with an optional node pin
//! - Shrink, periodic reap and deferred (grace-period) slab destruction
//! - A per-node buddy page allocator usable as the page backing

#![no_std]

extern crate alloc;

use core::fmt;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Size of a machine word; the smallest object a cache can serve.
pub const BYTES_PER_WORD: usize = core::mem::size_of::<usize>();

/// Suggested period for calling [`SlabRegistry::reap`] on every cpu.
pub const REAP_INTERVAL_MS: u64 = 2000;

/// Index of a processor core.
pub type CpuId = usize;

/// Index of a NUMA memory node.
pub type NodeId = usize;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size`, alignment, tunable or id.
    InvalidParam,
    /// Memory added by `add_memory` overlapped with existed memory.
    MemoryOverlap,
    /// No enough memory to allocate.
    NoMemory,
    /// Deallocate memory that was not handed out by this allocator.
    NotAllocated,
    /// No slab order yields a usable layout for the object size.
    NoGeometry,
    /// The cache still owns slabs with live objects.
    CacheBusy,
    /// Blocking operation requested from atomic context.
    AtomicContext,
    /// The cpu already has front-ends attached.
    AlreadyRegistered,
    /// The cpu was never registered.
    NotRegistered,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidParam => "invalid parameter",
            AllocError::MemoryOverlap => "memory region overlaps existing memory",
            AllocError::NoMemory => "out of memory",
            AllocError::NotAllocated => "address was not allocated here",
            AllocError::NoGeometry => "no viable slab geometry",
            AllocError::CacheBusy => "cache still has allocated objects",
            AllocError::AtomicContext => "cannot block in atomic context",
            AllocError::AlreadyRegistered => "worker already registered",
            AllocError::NotRegistered => "worker not registered",
        };
        f.write_str(msg)
    }
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// A block of `2^order` contiguous pages handed out by a [`PageBacking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    /// Address of the first page.
    pub base: usize,
    /// Block order; the range spans `2^order` pages.
    pub order: usize,
    /// Node the pages belong to.
    pub node: NodeId,
}

impl PageRange {
    /// Size of the range in bytes.
    pub const fn bytes(&self, page_size: usize) -> usize {
        page_size << self.order
    }
}

/// Page-granularity memory supplier used to grow slabs.
///
/// Implementations synchronize internally; every method takes `&self` and
/// may be called from any cpu.
pub trait PageBacking: Send + Sync {
    /// Allocate `2^order` contiguous pages.
    ///
    /// `Some(node)` restricts the search to that node, `None` accepts any.
    fn acquire_pages(&self, order: usize, node: Option<NodeId>) -> AllocResult<PageRange>;

    /// Return a block obtained from [`acquire_pages`](Self::acquire_pages).
    fn release_pages(&self, base: usize, order: usize) -> AllocResult;

    /// Number of memory nodes this backing serves (at least 1).
    fn node_count(&self) -> usize;
}

/// Processor topology seen by the allocator.
pub trait CpuTopology: Send + Sync {
    /// Id of the cpu running the caller.
    fn current_cpu(&self) -> CpuId;

    /// Memory node the given cpu is attached to.
    fn cpu_node(&self, cpu: CpuId) -> NodeId;

    /// Whether the caller runs where blocking is forbidden.
    fn in_atomic(&self) -> bool {
        false
    }
}

/// Optional per-object initializer invoked when a slab is grown.
pub type Constructor = fn(core::ptr::NonNull<u8>);

#[inline]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod buddy;
pub use buddy::{BuddyZone, MAX_BUDDY_ORDER};

pub mod page_allocator;
pub use page_allocator::NumaPageAllocator;

pub mod slab;
pub use slab::{
    AllocFlags, CacheInfo, CacheStats, CorruptionKind, NodeInfo, SlabCache, SlabFlags,
    SlabGeometry, StatsSnapshot,
};

pub mod registry;
pub use registry::{SlabConfig, SlabRegistry};
