//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use numa_slab_allocator::{
    AllocResult, CpuId, CpuTopology, NodeId, NumaPageAllocator, PageBacking, SlabConfig,
    SlabRegistry,
};

pub const PAGE_SIZE: usize = 0x1000;

thread_local! {
    static CURRENT_CPU: Cell<CpuId> = Cell::new(0);
}

/// Pretend the calling thread runs on `cpu`.
pub fn set_cpu(cpu: CpuId) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fixed cpu to node mapping; the current cpu comes from a thread-local.
pub struct TestTopology {
    cpu_nodes: Vec<NodeId>,
    atomic: AtomicBool,
}

impl TestTopology {
    pub fn new(cpu_nodes: Vec<NodeId>) -> Self {
        Self {
            cpu_nodes,
            atomic: AtomicBool::new(false),
        }
    }

    pub fn set_atomic(&self, atomic: bool) {
        self.atomic.store(atomic, Ordering::SeqCst);
    }
}

impl CpuTopology for TestTopology {
    fn current_cpu(&self) -> CpuId {
        CURRENT_CPU.with(|c| c.get())
    }

    fn cpu_node(&self, cpu: CpuId) -> NodeId {
        self.cpu_nodes.get(cpu).copied().unwrap_or(usize::MAX)
    }

    fn in_atomic(&self) -> bool {
        self.atomic.load(Ordering::SeqCst)
    }
}

/// Page-aligned memory taken from the global allocator.
pub struct TestHeap {
    ptr: *mut u8,
    layout: Layout,
}

impl TestHeap {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null(), "Failed to allocate test heap");
        Self { ptr, layout }
    }

    pub fn start(&self) -> usize {
        self.ptr as usize
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

// The heap is only handed out as plain addresses
unsafe impl Send for TestHeap {}
unsafe impl Sync for TestHeap {}

impl Drop for TestHeap {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// A registry over one test heap per node. Fields drop in declaration
/// order, so the registry goes before the memory it points into.
pub struct Fixture {
    pub registry: SlabRegistry<PAGE_SIZE>,
    pub pages: Arc<NumaPageAllocator<PAGE_SIZE>>,
    pub topology: Arc<TestTopology>,
    heaps: Vec<TestHeap>,
}

impl Fixture {
    /// `pages_per_node[n]` pages on node `n`; cpu `i` sits on `cpu_nodes[i]`.
    pub fn new(pages_per_node: &[usize], cpu_nodes: Vec<NodeId>, config: SlabConfig) -> Self {
        init_logger();
        let pages = Arc::new(NumaPageAllocator::<PAGE_SIZE>::new(pages_per_node.len()));
        let heaps: Vec<TestHeap> = pages_per_node.iter().map(|&n| TestHeap::new(n)).collect();
        for (node, heap) in heaps.iter().enumerate() {
            pages.add_memory(node, heap.start(), heap.size()).unwrap();
        }
        let topology = Arc::new(TestTopology::new(cpu_nodes));
        let backing: Arc<dyn PageBacking> = pages.clone();
        let registry =
            SlabRegistry::<PAGE_SIZE>::init(config, backing, topology.clone()).unwrap();
        Self {
            registry,
            pages,
            topology,
            heaps,
        }
    }

    /// One node with `pages` pages and a single cpu.
    pub fn single_node(pages: usize) -> Self {
        Self::new(&[pages], vec![0], SlabConfig::default())
    }

    /// Tear the registry down, keeping the memory alive for inspection.
    pub fn teardown(self) -> (AllocResult, Arc<NumaPageAllocator<PAGE_SIZE>>, Vec<TestHeap>) {
        let Self {
            registry,
            pages,
            heaps,
            ..
        } = self;
        (registry.teardown(), pages, heaps)
    }
}
