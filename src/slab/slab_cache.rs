//! Slab cache implementation.
//!
//! A [`SlabCache`] serves objects of one size. Allocation pops from the
//! calling cpu's front-end; an empty front-end is refilled in a batch from
//! the node's shared array or slab lists, and the lists grow a slab from
//! the page backing when they run dry. Frees push onto the front-end, and a
//! full front-end flushes its oldest batch back to the node.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{debug, error, trace};

use super::array_cache::ArrayCache;
use super::debug::{self, CorruptionKind, CorruptionSite, DEBUG, RED_ACTIVE, RED_INACTIVE};
use super::geometry::{SlabGeometry, Tunables};
use super::node_lists::{NodeLists, NodeListsInner};
use super::slab_node::SlabNode;
use super::stats::{CacheStats, StatsSnapshot};
use super::{AllocFlags, CacheInfo, NodeInfo, SlabEnv, SlabFlags};
use crate::{AllocError, AllocResult, Constructor, CpuId, NodeId, PageRange};

/// Upper bound on objects pulled by one refill of an idle front-end.
const BATCHREFILL_LIMIT: usize = 16;

type AllocPath<const PAGE_SIZE: usize> =
    fn(&SlabCache<PAGE_SIZE>, AllocFlags) -> AllocResult<usize>;
type FreePath<const PAGE_SIZE: usize> = fn(&SlabCache<PAGE_SIZE>, usize, SlabNode);

#[derive(Debug, Clone, Copy)]
struct CacheTunables {
    tunables: Tunables,
    /// Still on the size-derived defaults
    auto: bool,
}

/// Pages of a destroyed slab held back until a grace period completes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeferredReclaim {
    pages: PageRange,
    /// Off-slab descriptor to return to the metadata cache
    metadata: Option<usize>,
}

/// How the memory of a slab leaves its cache.
enum Teardown {
    Immediate,
    Deferred(DeferredReclaim),
}

/// A cache of equally sized objects.
pub struct SlabCache<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    name: String,
    geometry: SlabGeometry,
    flags: SlabFlags,
    ctor: Option<Constructor>,
    generic: bool,
    /// Source of off-slab descriptors
    metadata_cache: Option<Arc<SlabCache<PAGE_SIZE>>>,
    tunables: SpinNoIrq<CacheTunables>,
    /// Front-end of every cpu slot; `None` until the cpu registers
    cpu_caches: Box<[SpinNoIrq<Option<ArrayCache>>]>,
    nodes: Box<[NodeLists]>,
    env: Arc<SlabEnv<PAGE_SIZE>>,
    stats: Option<CacheStats>,
    alloc_path: AllocPath<PAGE_SIZE>,
    free_path: FreePath<PAGE_SIZE>,
    debug_checks: bool,
    poisoning: bool,
    deferred: SpinNoIrq<Vec<DeferredReclaim>>,
    destroyed: AtomicBool,
}

impl<const PAGE_SIZE: usize> SlabCache<PAGE_SIZE> {
    pub(crate) fn new(
        env: Arc<SlabEnv<PAGE_SIZE>>,
        name: &str,
        geometry: SlabGeometry,
        flags: SlabFlags,
        ctor: Option<Constructor>,
        metadata_cache: Option<Arc<SlabCache<PAGE_SIZE>>>,
        generic: bool,
    ) -> Self {
        let tunables = Tunables::for_size(geometry.buffer_size, PAGE_SIZE, env.active_cpus());
        let alien_limit = env.use_alien_caches.then(|| tunables.alien_limit());
        let nodes: Box<[NodeLists]> = (0..env.nodes)
            .map(|node| {
                let l3 = NodeLists::new(node, env.nodes, alien_limit);
                {
                    let mut lists = l3.lists.lock();
                    lists.free_limit = (1 + env.cpus_on_node(node)) * tunables.batch
                        + geometry.objects_per_slab;
                    if tunables.shared > 0 {
                        lists.shared =
                            Some(ArrayCache::new(tunables.shared * tunables.batch, tunables.batch));
                    }
                }
                l3
            })
            .collect();
        let cpu_caches = (0..env.max_cpus).map(|_| SpinNoIrq::new(None)).collect();

        let instrumented = env.stats || flags.contains(SlabFlags::STATS);
        let alloc_path: AllocPath<PAGE_SIZE> = if instrumented {
            Self::cache_alloc::<true>
        } else {
            Self::cache_alloc::<false>
        };
        let free_path: FreePath<PAGE_SIZE> = if instrumented {
            Self::cache_free::<true>
        } else {
            Self::cache_free::<false>
        };
        let poisoning = DEBUG && flags.contains(SlabFlags::POISON) && ctor.is_none();

        Self {
            name: String::from(name),
            geometry,
            flags,
            ctor,
            generic,
            metadata_cache,
            tunables: SpinNoIrq::new(CacheTunables {
                tunables,
                auto: true,
            }),
            cpu_caches,
            nodes,
            env,
            stats: instrumented.then(CacheStats::new),
            alloc_path,
            free_path,
            debug_checks: geometry.red_zone || poisoning,
            poisoning,
            deferred: SpinNoIrq::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> &SlabGeometry {
        &self.geometry
    }

    /// Usable bytes of every object.
    pub fn object_size(&self) -> usize {
        self.geometry.object_size
    }

    pub fn flags(&self) -> SlabFlags {
        self.flags
    }

    /// Whether this is one of the registry's generic size caches.
    pub fn is_generic(&self) -> bool {
        self.generic
    }

    pub(crate) fn has_metadata_cache(&self) -> bool {
        self.metadata_cache.is_some()
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn slab_at(&self, addr: usize) -> SlabNode {
        SlabNode::new(addr, self.geometry.buffer_size)
    }

    /// Slab holding the slot `objp`, if the slot belongs to this cache.
    fn slab_of(&self, objp: usize) -> Option<SlabNode> {
        let (cache, slab) = self.env.page_map.lookup(objp)?;
        (cache == self.id()).then(|| self.slab_at(slab))
    }

    fn stat(&self, f: impl FnOnce(&CacheStats)) {
        if let Some(stats) = &self.stats {
            f(stats);
        }
    }

    // ---- allocation ----

    /// Allocate one object.
    pub fn alloc(&self) -> AllocResult<NonNull<u8>> {
        self.alloc_flags(AllocFlags::empty())
    }

    /// Allocate one object honoring `flags`.
    pub fn alloc_flags(&self, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        let objp = (self.alloc_path)(self, flags)?;
        self.finish_alloc(objp, flags)
    }

    /// Allocate one object from the slabs of `node`.
    ///
    /// Falls back to other nodes when `node` is exhausted unless `flags`
    /// carries [`AllocFlags::THIS_NODE`].
    pub fn alloc_on_node(&self, node: NodeId, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        if node >= self.nodes.len() {
            return Err(AllocError::InvalidParam);
        }
        let (_, local) = self.env.current();
        if node == local {
            return self.alloc_flags(flags);
        }
        let objp = match self.alloc_node(node, flags | AllocFlags::THIS_NODE) {
            Ok(objp) => {
                self.stat(CacheStats::node_alloc);
                objp
            }
            // The fallback counts the objects it serves
            Err(_) if !flags.contains(AllocFlags::THIS_NODE) => self.fallback_alloc(node, flags)?,
            Err(e) => return Err(e),
        };
        self.finish_alloc(objp, flags)
    }

    fn finish_alloc(&self, objp: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        if self.debug_checks {
            self.check_after_alloc(objp);
        }
        let user = objp + self.geometry.obj_offset;
        if flags.contains(AllocFlags::ZERO) {
            unsafe { core::ptr::write_bytes(user as *mut u8, 0, self.geometry.object_size) };
        }
        NonNull::new(user as *mut u8).ok_or(AllocError::NoMemory)
    }

    fn cache_alloc<const STATS: bool>(&self, flags: AllocFlags) -> AllocResult<usize> {
        let mut missed = false;
        loop {
            let (cpu, node) = self.env.current();
            let Some(slot) = self.cpu_caches.get(cpu) else {
                return self.alloc_node(node, flags);
            };
            let mut guard = slot.lock();
            let Some(ac) = guard.as_mut() else {
                drop(guard);
                return self.alloc_node(node, flags);
            };

            if let Some(objp) = ac.pop() {
                ac.touched = true;
                if STATS && !missed {
                    self.stat(CacheStats::alloc_hit);
                }
                return Ok(objp);
            }
            if STATS && !missed {
                self.stat(CacheStats::alloc_miss);
            }
            missed = true;

            self.refill(ac, node);
            if let Some(objp) = ac.pop() {
                return Ok(objp);
            }
            drop(guard);

            // Node is dry; grow with no lock held, then retry the front-end
            if self.grow(node).is_err() {
                if flags.contains(AllocFlags::THIS_NODE) {
                    return Err(AllocError::NoMemory);
                }
                return self.fallback_alloc(node, flags);
            }
        }
    }

    /// Fill an empty front-end with one batch from `node`.
    fn refill(&self, ac: &mut ArrayCache, node: NodeId) {
        let mut batch = ac.batchcount();
        if !ac.touched && batch > BATCHREFILL_LIMIT {
            // Idle front-end: avoid pulling a full batch that may never be used
            batch = BATCHREFILL_LIMIT;
        }

        let mut lists = self.nodes[node].lists.lock();
        if let Some(shared) = lists.shared.as_mut() {
            if ac.transfer_from(shared, batch) > 0 {
                trace!("{}: refilled {} from shared array", self.name, ac.avail());
                return;
            }
        }

        let mut pulled = 0;
        while batch > 0 {
            let Some(addr) = lists.slab_with_free_objects() else {
                break;
            };
            let mut slab = self.slab_at(addr);
            if DEBUG {
                self.verify_slab(&slab);
            }
            lists.unlink(&slab);
            while !slab.is_full() && batch > 0 {
                ac.push(slab.alloc_object());
                batch -= 1;
                pulled += 1;
            }
            lists.link_after_alloc(&slab);
        }
        lists.free_objects -= pulled;
        drop(lists);

        // Only a successful pull marks the front-end as used
        if pulled > 0 {
            ac.touched = true;
            self.stat(|s| s.objects_out(pulled));
            trace!("{}: refilled {} from node {}", self.name, pulled, node);
        }
    }

    /// Take one object straight from the slab lists of `node`, growing
    /// there if needed.
    fn alloc_node(&self, node: NodeId, flags: AllocFlags) -> AllocResult<usize> {
        loop {
            {
                let mut lists = self.nodes[node].lists.lock();
                if let Some(addr) = lists.slab_with_free_objects() {
                    let mut slab = self.slab_at(addr);
                    lists.unlink(&slab);
                    let objp = slab.alloc_object();
                    lists.link_after_alloc(&slab);
                    lists.free_objects -= 1;
                    drop(lists);
                    self.stat(|s| s.objects_out(1));
                    return Ok(objp);
                }
            }
            if self.grow(node).is_err() {
                break;
            }
        }
        if flags.contains(AllocFlags::THIS_NODE) {
            return Err(AllocError::NoMemory);
        }
        self.fallback_alloc(node, flags)
    }

    /// Serve an allocation whose preferred node is exhausted.
    fn fallback_alloc(&self, preferred: NodeId, flags: AllocFlags) -> AllocResult<usize> {
        let pinned = flags | AllocFlags::THIS_NODE;
        for node in (0..self.nodes.len()).filter(|&n| n != preferred) {
            let has_free = self.nodes[node].lists.lock().free_objects > 0;
            if has_free {
                if let Ok(objp) = self.alloc_node(node, pinned) {
                    self.stat(CacheStats::node_alloc);
                    return Ok(objp);
                }
            }
        }

        // No node has spare objects: take pages wherever the backing has them
        let pages = self.acquire_pages(None)?;
        let node = pages.node;
        self.grow_from_pages(pages)?;
        let objp = self.alloc_node(node, pinned)?;
        if node != preferred {
            self.stat(CacheStats::node_alloc);
        }
        Ok(objp)
    }

    // ---- growth and destruction ----

    fn acquire_pages(&self, node: Option<NodeId>) -> AllocResult<PageRange> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(AllocError::NoMemory);
        }
        self.env
            .backing
            .acquire_pages(self.geometry.order, node)
            .map_err(|e| {
                self.stat(CacheStats::error);
                e
            })
    }

    /// Add one slab on `node`.
    fn grow(&self, node: NodeId) -> AllocResult {
        let pages = self.acquire_pages(Some(node))?;
        self.grow_from_pages(pages)
    }

    fn grow_from_pages(&self, pages: PageRange) -> AllocResult {
        let geo = &self.geometry;
        let node = pages.node;
        if node >= self.nodes.len() || pages.order != geo.order {
            error!(
                "{}: page backing returned order {} on node {}",
                self.name, pages.order, node
            );
            self.release_pages(pages);
            return Err(AllocError::NoMemory);
        }

        let colour = self.nodes[node].lists.lock().next_colour(geo.colour_count);
        let offset = colour * geo.colour_off;

        let (desc, s_mem) = match &self.metadata_cache {
            Some(meta) if geo.off_slab => match meta.alloc_on_node(node, AllocFlags::empty()) {
                Ok(desc) => (desc.as_ptr() as usize, pages.base + offset),
                Err(e) => {
                    self.release_pages(pages);
                    self.stat(CacheStats::error);
                    return Err(e);
                }
            },
            _ => (pages.base + offset, pages.base + offset + geo.mgmt_size),
        };

        let mut slab = self.slab_at(desc);
        slab.init(pages.base, offset, s_mem, node, geo.objects_per_slab);
        self.init_objects(&slab);

        if let Err(e) = self
            .env
            .page_map
            .insert(pages.base, geo.pages_per_slab(), self.id(), desc)
        {
            self.release_slab(pages, geo.off_slab.then_some(desc));
            return Err(e);
        }

        let mut lists = self.nodes[node].lists.lock();
        lists.empty.push_back(desc);
        lists.free_objects += geo.objects_per_slab;
        drop(lists);

        self.stat(CacheStats::grown);
        debug!(
            "{}: grew slab {:#x} on node {} (colour {})",
            self.name, pages.base, node, colour
        );
        Ok(())
    }

    fn init_objects(&self, slab: &SlabNode) {
        let geo = &self.geometry;
        for i in 0..geo.objects_per_slab {
            let objp = slab.object_addr(i);
            if geo.red_zone {
                debug::write_red_zone(objp, RED_INACTIVE);
                debug::write_red_zone(self.red_zone2(objp), RED_INACTIVE);
            }
            let user = objp + geo.obj_offset;
            if let Some(ctor) = self.ctor {
                if let Some(obj) = NonNull::new(user as *mut u8) {
                    ctor(obj);
                }
            } else if self.poisoning {
                debug::poison(user, geo.object_size);
            }
        }
    }

    /// Remove an unlinked, empty slab from the cache.
    fn destroy_slab(&self, slab: SlabNode) {
        if DEBUG {
            self.verify_slab(&slab);
        }
        let pages = PageRange {
            base: slab.base(),
            order: self.geometry.order,
            node: slab.node(),
        };
        let metadata = self.geometry.off_slab.then_some(slab.addr);
        self.env
            .page_map
            .remove(pages.base, self.geometry.pages_per_slab());

        let teardown = if self.flags.contains(SlabFlags::DESTROY_BY_RCU) {
            Teardown::Deferred(DeferredReclaim { pages, metadata })
        } else {
            Teardown::Immediate
        };
        match teardown {
            Teardown::Immediate => self.release_slab(pages, metadata),
            Teardown::Deferred(reclaim) => self.deferred.lock().push(reclaim),
        }
        debug!("{}: destroyed slab {:#x}", self.name, pages.base);
    }

    fn release_slab(&self, pages: PageRange, metadata: Option<usize>) {
        self.release_pages(pages);
        let desc = metadata.and_then(|d| NonNull::new(d as *mut u8));
        if let (Some(desc), Some(meta)) = (desc, &self.metadata_cache) {
            unsafe { meta.free(desc) };
        }
    }

    fn release_pages(&self, pages: PageRange) {
        if let Err(e) = self.env.backing.release_pages(pages.base, pages.order) {
            error!("{}: failed to release slab {:#x}: {:?}", self.name, pages.base, e);
        }
    }

    /// Release every slab waiting for a grace period. Returns how many.
    pub(crate) fn complete_grace_period(&self) -> usize {
        let pending = core::mem::take(&mut *self.deferred.lock());
        for reclaim in &pending {
            self.release_slab(reclaim.pages, reclaim.metadata);
        }
        pending.len()
    }

    // ---- free ----

    /// Return an object to the cache.
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated from this cache and not freed since;
    /// the caller must not use it afterwards.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        let objp = (obj.as_ptr() as usize).wrapping_sub(self.geometry.obj_offset);
        let Some(slab) = self.slab_of(objp) else {
            if DEBUG {
                self.corruption(CorruptionKind::ForeignObject, objp, None);
            }
            error!("{}: free of foreign object {:p}", self.name, obj);
            return;
        };
        if DEBUG {
            self.check_before_free(objp, &slab);
        }
        (self.free_path)(self, objp, slab)
    }

    fn cache_free<const STATS: bool>(&self, objp: usize, slab: SlabNode) {
        let (cpu, node) = self.env.current();
        let owner = slab.node();
        if owner != node {
            self.free_alien(objp, node, owner);
            return;
        }

        let Some(slot) = self.cpu_caches.get(cpu) else {
            return self.free_direct(objp, node);
        };
        let mut guard = slot.lock();
        let Some(ac) = guard.as_mut() else {
            drop(guard);
            return self.free_direct(objp, node);
        };
        if DEBUG && ac.contains(objp) {
            self.corruption(CorruptionKind::DoubleFree, objp, Some(&slab));
        }
        if ac.is_full() {
            if STATS {
                self.stat(CacheStats::free_miss);
            }
            self.flush(ac, node);
        } else if STATS {
            self.stat(CacheStats::free_hit);
        }
        ac.push(objp);
    }

    /// Free into the node lists without a front-end.
    fn free_direct(&self, objp: usize, node: NodeId) {
        let mut lists = self.nodes[node].lists.lock();
        self.free_block(&mut lists, core::iter::once(objp), node);
    }

    /// Stage an object owned by `owner` freed on `local`.
    fn free_alien(&self, objp: usize, local: NodeId, owner: NodeId) {
        self.stat(CacheStats::node_free);
        match self.nodes[local].alien(owner) {
            Some(alien) => {
                let mut ac = alien.lock();
                if ac.is_full() {
                    self.stat(CacheStats::node_overflow);
                    self.drain_alien(&mut ac, owner);
                }
                ac.push(objp);
            }
            None => self.free_direct(objp, owner),
        }
    }

    /// Hand every object of an alien array back to its owning node: into
    /// that node's shared array first, the rest into its slabs.
    fn drain_alien(&self, ac: &mut ArrayCache, owner: NodeId) {
        if ac.is_empty() {
            return;
        }
        let mut lists = self.nodes[owner].lists.lock();
        if let Some(shared) = lists.shared.as_mut() {
            let limit = ac.limit();
            shared.transfer_from(ac, limit);
        }
        self.free_block(&mut lists, ac.take_all(), owner);
    }

    /// Make room in a full front-end.
    fn flush(&self, ac: &mut ArrayCache, node: NodeId) {
        let batch = ac.batchcount();
        let mut lists = self.nodes[node].lists.lock();
        if let Some(shared) = lists.shared.as_mut() {
            let room = shared.room();
            if room > 0 {
                for objp in ac.take_oldest(batch.min(room)) {
                    shared.push(objp);
                }
                return;
            }
        }
        self.free_block(&mut lists, ac.take_oldest(batch), node);
    }

    /// Return objects of `node` into their slabs. Empty slabs beyond the
    /// node's free limit are destroyed on the spot.
    fn free_block(
        &self,
        lists: &mut NodeListsInner,
        objs: impl IntoIterator<Item = usize>,
        node: NodeId,
    ) {
        let mut freed = 0;
        for objp in objs {
            let Some(mut slab) = self.slab_of(objp) else {
                if DEBUG {
                    self.corruption(CorruptionKind::ForeignObject, objp, None);
                }
                continue;
            };
            if DEBUG && slab.node() != node {
                self.corruption(CorruptionKind::ForeignObject, objp, Some(&slab));
            }
            lists.unlink(&slab);
            if let Err(kind) = slab.free_object(objp) {
                self.corruption(kind, objp, Some(&slab));
            }
            lists.free_objects += 1;
            freed += 1;

            if slab.is_empty() {
                if lists.free_objects > lists.free_limit {
                    lists.free_objects -= self.geometry.objects_per_slab;
                    self.destroy_slab(slab);
                } else {
                    lists.empty.push_front(slab.addr);
                }
            } else {
                // Partial slabs drain toward the tail
                lists.partial.push_back(slab.addr);
            }
        }
        if freed > 0 {
            self.stat(|s| s.objects_in(freed));
        }
    }

    // ---- maintenance ----

    fn drain_count(ac: &ArrayCache, force: bool) -> usize {
        let avail = ac.avail();
        if force {
            return avail;
        }
        let tofree = (ac.limit() + 4) / 5;
        if tofree > avail {
            (avail + 1) / 2
        } else {
            tofree
        }
    }

    /// Trim a front-end unless it was used since the last pass.
    fn drain_array(&self, ac: &mut ArrayCache, node: NodeId, force: bool) {
        if ac.is_empty() {
            return;
        }
        if ac.touched && !force {
            ac.touched = false;
            return;
        }
        let tofree = Self::drain_count(ac, force);
        let mut lists = self.nodes[node].lists.lock();
        self.free_block(&mut lists, ac.take_oldest(tofree), node);
    }

    fn drain_shared(&self, node: NodeId, force: bool) {
        let mut lists = self.nodes[node].lists.lock();
        let Some(mut shared) = lists.shared.take() else {
            return;
        };
        if !shared.is_empty() {
            if shared.touched && !force {
                shared.touched = false;
            } else {
                let tofree = Self::drain_count(&shared, force);
                self.free_block(&mut lists, shared.take_oldest(tofree), node);
            }
        }
        lists.shared = Some(shared);
    }

    /// Destroy up to `tofree` empty slabs of `node`. Returns how many.
    fn drain_freelist(&self, node: NodeId, tofree: usize) -> usize {
        let mut freed = 0;
        while freed < tofree {
            let addr = {
                let mut lists = self.nodes[node].lists.lock();
                let Some(addr) = lists.empty.pop_back() else {
                    break;
                };
                lists.free_objects -= self.geometry.objects_per_slab;
                addr
            };
            self.destroy_slab(self.slab_at(addr));
            freed += 1;
        }
        freed
    }

    fn drain_node_aliens(&self, node: NodeId) {
        for remote in 0..self.nodes.len() {
            if let Some(alien) = self.nodes[node].alien(remote) {
                self.drain_alien(&mut alien.lock(), remote);
            }
        }
    }

    /// Flush every front-end, alien and shared array back to the slabs.
    fn drain_cpu_caches(&self) {
        for (cpu, slot) in self.cpu_caches.iter().enumerate() {
            let mut guard = slot.lock();
            if let Some(ac) = guard.as_mut() {
                self.drain_array(ac, self.env.node_of(cpu), true);
            }
        }
        for node in 0..self.nodes.len() {
            self.drain_node_aliens(node);
        }
        for node in 0..self.nodes.len() {
            self.drain_shared(node, true);
        }
    }

    /// Drain all cached objects and destroy every empty slab. Returns
    /// `true` when no slab is left.
    pub(crate) fn shrink(&self) -> bool {
        self.drain_cpu_caches();
        let mut busy = false;
        for node in 0..self.nodes.len() {
            self.drain_freelist(node, usize::MAX);
            let lists = self.nodes[node].lists.lock();
            busy |= !lists.full.is_empty() || !lists.partial.is_empty();
        }
        !busy
    }

    /// One reaper tick for `cpu`.
    pub(crate) fn reap(&self, cpu: CpuId, now_ms: u64, reap_node: NodeId) {
        let node = self.env.node_of(cpu);
        let l3 = &self.nodes[node];

        if let Some(alien) = l3.alien(reap_node) {
            if let Some(mut ac) = alien.try_lock() {
                self.drain_alien(&mut ac, reap_node);
            }
        }
        if let Some(slot) = self.cpu_caches.get(cpu) {
            let mut guard = slot.lock();
            if let Some(ac) = guard.as_mut() {
                self.drain_array(ac, node, false);
            }
        }

        if now_ms < l3.next_reap.load(Ordering::Relaxed) {
            return;
        }
        l3.next_reap
            .store(now_ms + self.env.node_reap_interval_ms, Ordering::Relaxed);

        self.drain_shared(node, false);

        let num = self.geometry.objects_per_slab;
        let trim = {
            let mut lists = l3.lists.lock();
            if lists.free_touched {
                lists.free_touched = false;
                None
            } else {
                Some((lists.free_limit + 5 * num - 1) / (5 * num))
            }
        };
        if let Some(tofree) = trim {
            let freed = self.drain_freelist(node, tofree);
            if freed > 0 {
                self.stat(|s| s.reaped(freed));
                debug!("{}: reaped {} slabs on node {}", self.name, freed, node);
            }
        }
    }

    fn free_limit(&self, node: NodeId, batch: usize) -> usize {
        (1 + self.env.cpus_on_node(node)) * batch + self.geometry.objects_per_slab
    }

    fn rebuild_node(&self, node: NodeId, tunables: Tunables) {
        let fresh = (tunables.shared > 0)
            .then(|| ArrayCache::new(tunables.shared * tunables.batch, tunables.batch));
        let mut lists = self.nodes[node].lists.lock();
        let old = core::mem::replace(&mut lists.shared, fresh);
        if let Some(mut old) = old {
            self.free_block(&mut lists, old.take_all(), node);
        }
        lists.free_limit = self.free_limit(node, tunables.batch);
    }

    /// Replace front-end and shared sizing.
    pub(crate) fn tune(&self, tunables: Tunables) -> AllocResult {
        tunables.validate()?;
        *self.tunables.lock() = CacheTunables {
            tunables,
            auto: false,
        };

        for (cpu, slot) in self.cpu_caches.iter().enumerate() {
            let old = {
                let mut guard = slot.lock();
                if guard.is_some() {
                    guard.replace(ArrayCache::new(tunables.limit, tunables.batch))
                } else {
                    None
                }
            };
            if let Some(mut old) = old {
                let node = self.env.node_of(cpu);
                let mut lists = self.nodes[node].lists.lock();
                self.free_block(&mut lists, old.take_all(), node);
            }
        }
        for node in 0..self.nodes.len() {
            self.rebuild_node(node, tunables);
        }
        debug!(
            "{}: tuned limit {} batch {} shared {}",
            self.name, tunables.limit, tunables.batch, tunables.shared
        );
        Ok(())
    }

    /// Give a newly registered cpu its front-end.
    pub(crate) fn attach_cpu(&self, cpu: CpuId, node: NodeId) {
        let (tunables, shared_enabled) = {
            let mut tun = self.tunables.lock();
            let mut enabled = false;
            if tun.auto && tun.tunables.shared == 0 {
                let fresh = Tunables::for_size(
                    self.geometry.buffer_size,
                    PAGE_SIZE,
                    self.env.active_cpus(),
                );
                if fresh.shared > 0 {
                    tun.tunables.shared = fresh.shared;
                    enabled = true;
                }
            }
            (tun.tunables, enabled)
        };

        if let Some(slot) = self.cpu_caches.get(cpu) {
            let old = slot.lock().replace(ArrayCache::new(tunables.limit, tunables.batch));
            if let Some(mut old) = old {
                let mut lists = self.nodes[node].lists.lock();
                self.free_block(&mut lists, old.take_all(), node);
            }
        }

        if shared_enabled {
            for n in 0..self.nodes.len() {
                self.rebuild_node(n, tunables);
            }
        } else if let Some(l3) = self.nodes.get(node) {
            l3.lists.lock().free_limit = self.free_limit(node, tunables.batch);
        }
    }

    /// Flush and drop the front-end of a departing cpu. When it was the
    /// last cpu of its node, the node's staging arrays and empty slabs are
    /// released too.
    pub(crate) fn detach_cpu(&self, cpu: CpuId, node: NodeId, last_on_node: bool) {
        let old = self.cpu_caches.get(cpu).and_then(|slot| slot.lock().take());
        let batch = self.tunables.lock().tunables.batch;
        {
            let mut lists = self.nodes[node].lists.lock();
            if let Some(mut old) = old {
                self.free_block(&mut lists, old.take_all(), node);
            }
            lists.free_limit = self.free_limit(node, batch);
        }
        if last_on_node {
            self.drain_shared(node, true);
            self.drain_node_aliens(node);
            self.drain_freelist(node, usize::MAX);
        }
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    // ---- inspection ----

    /// Objects currently held by the front-end of `cpu`.
    pub fn cpu_cache_avail(&self, cpu: CpuId) -> Option<usize> {
        self.cpu_caches
            .get(cpu)?
            .lock()
            .as_ref()
            .map(ArrayCache::avail)
    }

    /// Node owning the slab of `obj`, if `obj` belongs to this cache.
    pub fn object_node(&self, obj: NonNull<u8>) -> Option<NodeId> {
        let objp = (obj.as_ptr() as usize).wrapping_sub(self.geometry.obj_offset);
        self.slab_of(objp).map(|slab| slab.node())
    }

    /// Whether `obj` lies in a slab of this cache.
    pub fn contains(&self, obj: NonNull<u8>) -> bool {
        self.object_node(obj).is_some()
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.stats.as_ref().map(CacheStats::snapshot)
    }

    pub fn info(&self) -> CacheInfo {
        let num = self.geometry.objects_per_slab;
        let tunables = self.tunables.lock().tunables;
        let mut info = CacheInfo {
            name: self.name.clone(),
            object_size: self.geometry.object_size,
            buffer_size: self.geometry.buffer_size,
            active_objects: 0,
            total_objects: 0,
            active_slabs: 0,
            total_slabs: 0,
            objects_per_slab: num,
            pages_per_slab: self.geometry.pages_per_slab(),
            limit: tunables.limit,
            batch: tunables.batch,
            shared: tunables.shared,
            deferred_slabs: self.deferred.lock().len(),
            nodes: Vec::with_capacity(self.nodes.len()),
            stats: self.stats(),
        };

        for l3 in self.nodes.iter() {
            let alien_avail = (0..self.nodes.len())
                .filter_map(|remote| l3.alien(remote))
                .map(|a| a.lock().avail())
                .sum();
            let lists = l3.lists.lock();
            let partial_active: usize = lists
                .partial
                .iter()
                .map(|addr| self.slab_at(addr).in_use())
                .sum();
            info.active_objects += lists.full.len() * num + partial_active;
            info.active_slabs += lists.full.len() + lists.partial.len();
            info.total_slabs += lists.total_slabs();
            info.nodes.push(NodeInfo {
                node: l3.node,
                full_slabs: lists.full.len(),
                partial_slabs: lists.partial.len(),
                empty_slabs: lists.empty.len(),
                free_objects: lists.free_objects,
                free_limit: lists.free_limit,
                shared_avail: lists.shared.as_ref().map_or(0, ArrayCache::avail),
                shared_limit: lists.shared.as_ref().map_or(0, ArrayCache::limit),
                alien_avail,
            });
        }
        info.total_objects = info.total_slabs * num;
        info
    }

    // ---- debug checks ----

    fn red_zone2(&self, objp: usize) -> usize {
        objp + self.geometry.buffer_size - debug::RED_ZONE_SIZE
    }

    fn verify_slab(&self, slab: &SlabNode) {
        let first = if self.geometry.off_slab {
            slab.s_mem()
        } else {
            slab.addr
        };
        if !slab.is_valid() || slab.base() + slab.colour_off() != first {
            self.corruption(CorruptionKind::FreeList, slab.addr, Some(slab));
        }
        if let Err(kind) = slab.check_free_list() {
            self.corruption(kind, slab.s_mem(), Some(slab));
        }
    }

    fn check_after_alloc(&self, objp: usize) {
        let geo = &self.geometry;
        if geo.red_zone {
            let rz2 = self.red_zone2(objp);
            if debug::read_red_zone(objp) != RED_INACTIVE
                || debug::read_red_zone(rz2) != RED_INACTIVE
            {
                self.corruption(CorruptionKind::RedZone, objp, self.slab_of(objp).as_ref());
            }
            debug::write_red_zone(objp, RED_ACTIVE);
            debug::write_red_zone(rz2, RED_ACTIVE);
        }
        if self.poisoning && !debug::poison_intact(objp + geo.obj_offset, geo.object_size) {
            self.corruption(CorruptionKind::Poison, objp, self.slab_of(objp).as_ref());
        }
    }

    fn check_before_free(&self, objp: usize, slab: &SlabNode) {
        if slab.index_of(objp).is_none() {
            self.corruption(CorruptionKind::Misaligned, objp, Some(slab));
        }
        let geo = &self.geometry;
        if geo.red_zone {
            let rz2 = self.red_zone2(objp);
            let (rz1_val, rz2_val) = (debug::read_red_zone(objp), debug::read_red_zone(rz2));
            if rz1_val == RED_INACTIVE && rz2_val == RED_INACTIVE {
                self.corruption(CorruptionKind::DoubleFree, objp, Some(slab));
            }
            if rz1_val != RED_ACTIVE || rz2_val != RED_ACTIVE {
                self.corruption(CorruptionKind::RedZone, objp, Some(slab));
            }
            debug::write_red_zone(objp, RED_INACTIVE);
            debug::write_red_zone(rz2, RED_INACTIVE);
        }
        if self.poisoning {
            debug::poison(objp + geo.obj_offset, geo.object_size);
        }
    }

    fn corruption(&self, kind: CorruptionKind, objp: usize, slab: Option<&SlabNode>) -> ! {
        let dump_len = if self.slab_of(objp).is_some() {
            self.geometry.buffer_size
        } else {
            0
        };
        debug::report_corruption(
            kind,
            CorruptionSite {
                cache: &self.name,
                objp,
                slab_base: slab.map_or(0, SlabNode::base),
                in_use: slab.map_or(0, SlabNode::in_use),
                dump_len,
            },
        )
    }
}
