//! Cache registry.
//!
//! The registry owns every live cache, the generic size caches that hold
//! off-slab descriptors, and the set of registered worker cpus. All of its
//! mutation goes through one lock that the allocation paths never take.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{debug, info, warn};

use crate::slab::{GeometryLimits, PageMap, SlabEnv, Tunables};
use crate::{
    AllocError, AllocResult, Constructor, CpuId, CpuTopology, NodeId, PageBacking, SlabCache,
    SlabFlags, SlabGeometry,
};

/// Smallest generic cache.
const GENERIC_MIN_SIZE: usize = 32;
/// Largest generic cache, further capped by the maximum object size.
const GENERIC_MAX_SIZE: usize = 128 * 1024;

/// Registry-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    /// Front-end slots per cache; cpu ids must stay below this.
    pub max_cpus: usize,
    /// Largest slab order.
    pub max_order: usize,
    /// Order past which slab growth stops searching for less waste.
    pub break_order: usize,
    pub cache_line_size: usize,
    /// Stage remote frees in per-node alien arrays.
    pub use_alien_caches: bool,
    /// Period of shared array and empty-list trimming per node.
    pub node_reap_interval_ms: u64,
    /// Collect statistics in every cache.
    pub stats: bool,
}

impl SlabConfig {
    pub const fn new() -> Self {
        Self {
            max_cpus: 64,
            max_order: 10,
            break_order: 1,
            cache_line_size: 64,
            use_alien_caches: true,
            node_reap_interval_ms: 4000,
            stats: false,
        }
    }

    fn validate(&self, page_size: usize) -> AllocResult {
        if self.max_cpus == 0
            || !self.cache_line_size.is_power_of_two()
            || !page_size.is_power_of_two()
            || self.break_order > self.max_order
            || self.max_order > crate::MAX_BUDDY_ORDER
        {
            return Err(AllocError::InvalidParam);
        }
        Ok(())
    }
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct RegistryInner<const PAGE_SIZE: usize> {
    caches: Vec<Arc<SlabCache<PAGE_SIZE>>>,
    /// Generic caches by ascending size; also present in `caches`
    generic: Vec<Arc<SlabCache<PAGE_SIZE>>>,
    /// Node of every registered cpu, indexed by cpu id
    workers: Box<[Option<NodeId>]>,
    /// Remote node whose alien array each cpu drains next
    reap_node: Box<[NodeId]>,
}

impl<const PAGE_SIZE: usize> RegistryInner<PAGE_SIZE> {
    fn position(&self, cache: &Arc<SlabCache<PAGE_SIZE>>) -> Option<usize> {
        self.caches.iter().position(|c| Arc::ptr_eq(c, cache))
    }

    /// Smallest on-slab generic cache serving `bytes`.
    fn metadata_cache_for(&self, bytes: usize) -> Option<&Arc<SlabCache<PAGE_SIZE>>> {
        self.generic
            .iter()
            .find(|c| c.object_size() >= bytes && !c.has_metadata_cache())
    }

    fn registered(&self) -> impl Iterator<Item = (CpuId, NodeId)> + '_ {
        self.workers
            .iter()
            .enumerate()
            .filter_map(|(cpu, node)| node.map(|node| (cpu, node)))
    }
}

/// Owner of all slab caches of one allocator instance.
pub struct SlabRegistry<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    env: Arc<SlabEnv<PAGE_SIZE>>,
    inner: SpinNoIrq<RegistryInner<PAGE_SIZE>>,
}

impl<const PAGE_SIZE: usize> SlabRegistry<PAGE_SIZE> {
    /// Build a registry on top of `backing` and create the generic caches.
    pub fn init(
        config: SlabConfig,
        backing: Arc<dyn PageBacking>,
        topology: Arc<dyn CpuTopology>,
    ) -> AllocResult<Self> {
        config.validate(PAGE_SIZE)?;
        let nodes = backing.node_count().max(1);
        let env = Arc::new(SlabEnv {
            backing,
            topology,
            page_map: PageMap::new(),
            limits: GeometryLimits {
                page_size: PAGE_SIZE,
                max_order: config.max_order,
                break_order: config.break_order,
                cache_line: config.cache_line_size,
            },
            max_cpus: config.max_cpus,
            nodes,
            use_alien_caches: config.use_alien_caches && nodes > 1,
            node_reap_interval_ms: config.node_reap_interval_ms,
            stats: config.stats,
            node_cpus: (0..nodes).map(|_| AtomicUsize::new(0)).collect(),
            active_cpus: AtomicUsize::new(0),
        });

        let registry = Self {
            env,
            inner: SpinNoIrq::new(RegistryInner {
                caches: Vec::new(),
                generic: Vec::new(),
                workers: (0..config.max_cpus).map(|_| None).collect(),
                reap_node: (0..config.max_cpus).map(|_| 0).collect(),
            }),
        };

        let max_size = GENERIC_MAX_SIZE.min(registry.env.limits.max_object_size());
        let mut size = GENERIC_MIN_SIZE;
        while size <= max_size {
            let name = alloc::format!("size-{}", size);
            registry.insert_cache(&name, size, 0, SlabFlags::HWCACHE_ALIGN, None, true)?;
            size <<= 1;
        }

        info!(
            "slab registry: {} nodes, {} cpu slots, generic caches up to {} bytes",
            nodes, config.max_cpus, max_size
        );
        Ok(registry)
    }

    /// Create a cache for objects of `size` bytes.
    ///
    /// `align` of 0 means word alignment. `ctor` runs once per object when
    /// its slab is grown, never on reuse.
    pub fn create_cache(
        &self,
        name: &str,
        size: usize,
        align: usize,
        flags: SlabFlags,
        ctor: Option<Constructor>,
    ) -> AllocResult<Arc<SlabCache<PAGE_SIZE>>> {
        if self.env.topology.in_atomic() {
            return Err(AllocError::AtomicContext);
        }
        if flags.contains(SlabFlags::DESTROY_BY_RCU | SlabFlags::POISON) {
            // Objects of such caches stay readable after free
            return Err(AllocError::InvalidParam);
        }
        self.insert_cache(name, size, align, flags, ctor, false)
    }

    fn insert_cache(
        &self,
        name: &str,
        size: usize,
        align: usize,
        flags: SlabFlags,
        ctor: Option<Constructor>,
        generic: bool,
    ) -> AllocResult<Arc<SlabCache<PAGE_SIZE>>> {
        let mut inner = self.inner.lock();
        if inner.caches.iter().any(|c| c.name() == name) {
            warn!("slab registry: duplicate cache name '{}'", name);
        }

        let geometry = SlabGeometry::compute(size, align, flags, &self.env.limits, |bytes| {
            inner.metadata_cache_for(bytes).is_some()
        })?;
        let metadata_cache = if geometry.off_slab {
            inner.metadata_cache_for(geometry.mgmt_size).cloned()
        } else {
            None
        };

        let cache = Arc::new(SlabCache::new(
            self.env.clone(),
            name,
            geometry,
            flags,
            ctor,
            metadata_cache,
            generic,
        ));
        let workers: Vec<_> = inner.registered().collect();
        for (cpu, node) in workers {
            cache.attach_cpu(cpu, node);
        }

        info!(
            "slab cache '{}': object {} slot {} align {}, {} objects on {} pages, {} colours{}",
            name,
            geometry.object_size,
            geometry.buffer_size,
            geometry.align,
            geometry.objects_per_slab,
            geometry.pages_per_slab(),
            geometry.colour_count,
            if geometry.off_slab { ", off-slab" } else { "" }
        );

        inner.caches.push(cache.clone());
        if generic {
            inner.generic.push(cache.clone());
        }
        Ok(cache)
    }

    /// Remove an empty cache from the registry.
    ///
    /// Fails with [`AllocError::CacheBusy`] while any object is still
    /// allocated; the cache then stays registered and usable.
    pub fn destroy_cache(&self, cache: &Arc<SlabCache<PAGE_SIZE>>) -> AllocResult {
        if cache.is_generic() {
            return Err(AllocError::InvalidParam);
        }
        let mut inner = self.inner.lock();
        let index = inner.position(cache).ok_or(AllocError::InvalidParam)?;
        if !cache.shrink() {
            warn!("slab cache '{}': destroy with objects in use", cache.name());
            return Err(AllocError::CacheBusy);
        }
        cache.complete_grace_period();
        cache.mark_destroyed();
        inner.caches.remove(index);
        debug!("slab cache '{}': destroyed", cache.name());
        Ok(())
    }

    /// Release every cached object and empty slab of `cache`. Returns
    /// `true` when the cache is left without slabs.
    pub fn shrink_cache(&self, cache: &SlabCache<PAGE_SIZE>) -> bool {
        let _guard = self.inner.lock();
        cache.shrink()
    }

    /// Resize the front-ends and shared arrays of `cache`.
    ///
    /// Requires `limit >= 1` and `1 <= batch <= limit`; a `shared` factor of
    /// 0 disables the shared arrays.
    pub fn tune_cache(
        &self,
        cache: &SlabCache<PAGE_SIZE>,
        limit: usize,
        batch: usize,
        shared: usize,
    ) -> AllocResult {
        let _guard = self.inner.lock();
        cache.tune(Tunables {
            limit,
            batch,
            shared,
        })
    }

    /// Bring `cpu` online: every cache gains a front-end for it.
    pub fn register_worker(&self, cpu: CpuId) -> AllocResult {
        let node = self.env.topology.cpu_node(cpu);
        if node >= self.env.nodes {
            return Err(AllocError::InvalidParam);
        }
        let mut inner = self.inner.lock();
        let slot = inner.workers.get_mut(cpu).ok_or(AllocError::InvalidParam)?;
        if slot.is_some() {
            return Err(AllocError::AlreadyRegistered);
        }
        *slot = Some(node);
        inner.reap_node[cpu] = (node + 1) % self.env.nodes;

        self.env.node_cpus[node].fetch_add(1, Ordering::Relaxed);
        self.env.active_cpus.fetch_add(1, Ordering::Relaxed);
        for cache in inner.caches.iter() {
            cache.attach_cpu(cpu, node);
        }
        info!("slab registry: cpu {} online on node {}", cpu, node);
        Ok(())
    }

    /// Take `cpu` offline, flushing its front-ends back to its node.
    pub fn unregister_worker(&self, cpu: CpuId) -> AllocResult {
        let mut inner = self.inner.lock();
        let node = inner
            .workers
            .get_mut(cpu)
            .ok_or(AllocError::InvalidParam)?
            .take()
            .ok_or(AllocError::NotRegistered)?;

        let remaining = self.env.node_cpus[node].fetch_sub(1, Ordering::Relaxed) - 1;
        self.env.active_cpus.fetch_sub(1, Ordering::Relaxed);
        // User caches first so their off-slab descriptors reach the generic
        // caches before those are drained
        for cache in inner.caches.iter().rev() {
            cache.detach_cpu(cpu, node, remaining == 0);
        }
        info!("slab registry: cpu {} offline", cpu);
        Ok(())
    }

    /// Periodic maintenance for `cpu`, meant to run on that cpu every
    /// [`REAP_INTERVAL_MS`](crate::REAP_INTERVAL_MS).
    ///
    /// Returns `false` when the tick was skipped because the registry was
    /// busy or the cpu is not registered.
    pub fn reap(&self, cpu: CpuId, now_ms: u64) -> bool {
        let Some(mut inner) = self.inner.try_lock() else {
            return false;
        };
        if !matches!(inner.workers.get(cpu), Some(Some(_))) {
            return false;
        }
        let reap_node = inner.reap_node[cpu];
        for cache in inner.caches.iter() {
            cache.reap(cpu, now_ms, reap_node);
        }
        inner.reap_node[cpu] = (reap_node + 1) % self.env.nodes;
        true
    }

    /// Free an object of any cache of this registry.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object allocated from one of this registry's
    /// caches. The caller must not use it afterwards.
    pub unsafe fn free(&self, obj: NonNull<u8>) -> AllocResult {
        let (cache, _) = self
            .env
            .page_map
            .lookup(obj.as_ptr() as usize)
            .ok_or(AllocError::NotAllocated)?;
        // A cache with slabs is still registered, so the handle is alive
        let cache = unsafe { &*(cache as *const SlabCache<PAGE_SIZE>) };
        unsafe { cache.free(obj) };
        Ok(())
    }

    /// Cache owning `obj`, if any.
    pub fn cache_of(&self, obj: NonNull<u8>) -> Option<Arc<SlabCache<PAGE_SIZE>>> {
        let (id, _) = self.env.page_map.lookup(obj.as_ptr() as usize)?;
        self.inner
            .lock()
            .caches
            .iter()
            .find(|c| Arc::as_ptr(c) as usize == id)
            .cloned()
    }

    /// Smallest generic cache serving `size` bytes.
    pub fn generic_cache(&self, size: usize) -> Option<Arc<SlabCache<PAGE_SIZE>>> {
        self.inner
            .lock()
            .generic
            .iter()
            .find(|c| c.object_size() >= size)
            .cloned()
    }

    /// Handles to every registered cache, in creation order.
    pub fn caches(&self) -> Vec<Arc<SlabCache<PAGE_SIZE>>> {
        self.inner.lock().caches.clone()
    }

    /// Mark a grace period as elapsed: every slab queued by a
    /// [`DESTROY_BY_RCU`](SlabFlags::DESTROY_BY_RCU) cache goes back to the
    /// page backing. Returns the number of slabs released.
    pub fn complete_grace_period(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .caches
            .iter()
            .map(|cache| cache.complete_grace_period())
            .sum()
    }

    /// Number of nodes the registry spreads slabs over.
    pub fn node_count(&self) -> usize {
        self.env.nodes
    }

    /// Shrink every cache and drop the registry.
    ///
    /// Fails with [`AllocError::CacheBusy`] when some cache still holds
    /// allocated objects; the slabs of such caches are not returned to the
    /// backing.
    pub fn teardown(self) -> AllocResult {
        let inner = self.inner.lock();
        let mut busy = false;
        // Generic caches hold the descriptors of larger caches; release from
        // the user caches down to the smallest generic cache
        let user = inner.caches.iter().filter(|c| !c.is_generic());
        for cache in user.chain(inner.generic.iter().rev()) {
            cache.complete_grace_period();
            if !cache.shrink() {
                warn!("slab cache '{}': teardown with objects in use", cache.name());
                busy = true;
            }
            cache.complete_grace_period();
            cache.mark_destroyed();
        }
        if busy {
            return Err(AllocError::CacheBusy);
        }
        info!("slab registry: torn down");
        Ok(())
    }
}
