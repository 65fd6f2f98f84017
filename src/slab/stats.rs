//! Cache statistics.
//!
//! Counters are relaxed atomics; a snapshot is only approximately
//! consistent while other cpus keep allocating.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Live counters of an instrumented cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    active: AtomicUsize,
    allocations: AtomicUsize,
    high_mark: AtomicUsize,
    grown: AtomicUsize,
    reaped: AtomicUsize,
    errors: AtomicUsize,
    node_allocs: AtomicUsize,
    node_frees: AtomicUsize,
    node_overflow: AtomicUsize,
    alloc_hit: AtomicUsize,
    alloc_miss: AtomicUsize,
    free_hit: AtomicUsize,
    free_miss: AtomicUsize,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Objects taken out of slabs and not yet returned to them
    pub active: usize,
    /// Objects taken out of slabs over the cache lifetime
    pub allocations: usize,
    /// Highest value `active` reached
    pub high_mark: usize,
    /// Slabs grown
    pub grown: usize,
    /// Empty slabs released by the reaper
    pub reaped: usize,
    /// Failed growth attempts
    pub errors: usize,
    /// Allocations served from a node other than the caller's
    pub node_allocs: usize,
    /// Frees of objects owned by a remote node
    pub node_frees: usize,
    /// Times an alien array was full and had to be drained
    pub node_overflow: usize,
    pub alloc_hit: usize,
    pub alloc_miss: usize,
    pub free_hit: usize,
    pub free_miss: usize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CacheStats {
    pub const fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            high_mark: AtomicUsize::new(0),
            grown: AtomicUsize::new(0),
            reaped: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            node_allocs: AtomicUsize::new(0),
            node_frees: AtomicUsize::new(0),
            node_overflow: AtomicUsize::new(0),
            alloc_hit: AtomicUsize::new(0),
            alloc_miss: AtomicUsize::new(0),
            free_hit: AtomicUsize::new(0),
            free_miss: AtomicUsize::new(0),
        }
    }

    /// `n` objects left their slabs.
    pub(crate) fn objects_out(&self, n: usize) {
        let active = self.active.fetch_add(n, Ordering::Relaxed) + n;
        self.allocations.fetch_add(n, Ordering::Relaxed);
        self.high_mark.fetch_max(active, Ordering::Relaxed);
    }

    /// `n` objects went back into their slabs.
    pub(crate) fn objects_in(&self, n: usize) {
        self.active.fetch_sub(n, Ordering::Relaxed);
    }

    pub(crate) fn grown(&self) {
        bump(&self.grown);
    }

    pub(crate) fn reaped(&self, slabs: usize) {
        self.reaped.fetch_add(slabs, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        bump(&self.errors);
    }

    pub(crate) fn node_alloc(&self) {
        bump(&self.node_allocs);
    }

    pub(crate) fn node_free(&self) {
        bump(&self.node_frees);
    }

    pub(crate) fn node_overflow(&self) {
        bump(&self.node_overflow);
    }

    pub(crate) fn alloc_hit(&self) {
        bump(&self.alloc_hit);
    }

    pub(crate) fn alloc_miss(&self) {
        bump(&self.alloc_miss);
    }

    pub(crate) fn free_hit(&self) {
        bump(&self.free_hit);
    }

    pub(crate) fn free_miss(&self) {
        bump(&self.free_miss);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        StatsSnapshot {
            active: get(&self.active),
            allocations: get(&self.allocations),
            high_mark: get(&self.high_mark),
            grown: get(&self.grown),
            reaped: get(&self.reaped),
            errors: get(&self.errors),
            node_allocs: get(&self.node_allocs),
            node_frees: get(&self.node_frees),
            node_overflow: get(&self.node_overflow),
            alloc_hit: get(&self.alloc_hit),
            alloc_miss: get(&self.alloc_miss),
            free_hit: get(&self.free_hit),
            free_miss: get(&self.free_miss),
        }
    }
}
