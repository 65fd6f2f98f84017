//! Per-node slab lists.
//!
//! Every slab of a node sits on exactly one of the full, partial and empty
//! lists, chosen by its in-use count. The lists, counters and shared array
//! are guarded by the node lock; each alien array has a lock of its own.

use alloc::boxed::Box;
use core::sync::atomic::AtomicU64;

use kspin::SpinNoIrq;

use super::array_cache::ArrayCache;
use super::slab_list::SlabIntrusiveList;
use super::slab_node::SlabNode;
use crate::NodeId;

pub(crate) struct NodeListsInner {
    pub full: SlabIntrusiveList,
    pub partial: SlabIntrusiveList,
    pub empty: SlabIntrusiveList,
    /// Free objects across all slabs of this node
    pub free_objects: usize,
    /// Above this many free objects, empty slabs are released on free
    pub free_limit: usize,
    /// Next coloring index handed to a grown slab
    pub colour_next: usize,
    /// An empty slab was used since the last reap
    pub free_touched: bool,
    pub shared: Option<ArrayCache>,
}

impl NodeListsInner {
    const fn new() -> Self {
        Self {
            full: SlabIntrusiveList::new(),
            partial: SlabIntrusiveList::new(),
            empty: SlabIntrusiveList::new(),
            free_objects: 0,
            free_limit: 0,
            colour_next: 0,
            free_touched: false,
            shared: None,
        }
    }

    fn list_of(&mut self, slab: &SlabNode) -> &mut SlabIntrusiveList {
        if slab.is_empty() {
            &mut self.empty
        } else if slab.is_full() {
            &mut self.full
        } else {
            &mut self.partial
        }
    }

    /// Detach `slab` from the list its in-use count places it on.
    pub fn unlink(&mut self, slab: &SlabNode) {
        self.list_of(slab).remove(slab.addr);
    }

    /// Slab to take objects from: a partial one if any, else an empty one.
    pub fn slab_with_free_objects(&mut self) -> Option<usize> {
        if let Some(slab) = self.partial.front() {
            return Some(slab);
        }
        let slab = self.empty.front()?;
        self.free_touched = true;
        Some(slab)
    }

    /// Relink a slab that just handed out objects.
    pub fn link_after_alloc(&mut self, slab: &SlabNode) {
        if slab.is_full() {
            self.full.push_front(slab.addr);
        } else {
            self.partial.push_front(slab.addr);
        }
    }

    /// Advance the coloring rotation and return the index to use.
    pub fn next_colour(&mut self, colour_count: usize) -> usize {
        let colour = self.colour_next;
        self.colour_next += 1;
        if self.colour_next >= colour_count {
            self.colour_next = 0;
        }
        colour
    }

    pub fn total_slabs(&self) -> usize {
        self.full.len() + self.partial.len() + self.empty.len()
    }
}

pub(crate) struct NodeLists {
    pub node: NodeId,
    pub lists: SpinNoIrq<NodeListsInner>,
    /// Staging arrays for objects owned by each remote node, indexed by
    /// that node. `None` for this node itself or when aliens are disabled.
    pub alien: Box<[Option<SpinNoIrq<ArrayCache>>]>,
    /// Reaper deadline for the shared array and empty list (ms)
    pub next_reap: AtomicU64,
}

impl NodeLists {
    pub fn new(node: NodeId, nodes: usize, alien_limit: Option<usize>) -> Self {
        let alien = (0..nodes)
            .map(|remote| match alien_limit {
                Some(limit) if remote != node => Some(SpinNoIrq::new(ArrayCache::new(limit, 0))),
                _ => None,
            })
            .collect();
        Self {
            node,
            lists: SpinNoIrq::new(NodeListsInner::new()),
            alien,
            next_reap: AtomicU64::new(0),
        }
    }

    pub fn alien(&self, remote: NodeId) -> Option<&SpinNoIrq<ArrayCache>> {
        self.alien.get(remote).and_then(Option::as_ref)
    }
}
