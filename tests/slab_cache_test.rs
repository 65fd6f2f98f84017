//! Integration tests for single-node cache behavior.

mod common;

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{set_cpu, Fixture, PAGE_SIZE};
use numa_slab_allocator::{AllocError, AllocFlags, SlabCache, SlabConfig, SlabFlags};

fn slab_shape(cache: &SlabCache<PAGE_SIZE>) -> Vec<(usize, usize, usize)> {
    cache
        .info()
        .nodes
        .iter()
        .map(|n| (n.full_slabs, n.partial_slabs, n.empty_slabs))
        .collect()
}

#[test]
fn test_alloc_1000_distinct_objects() {
    let fx = Fixture::single_node(1024);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("objects-64", 64, 0, SlabFlags::empty(), None)
        .unwrap();

    let mut seen = HashSet::new();
    let mut objs = Vec::new();
    for _ in 0..1000 {
        let obj = cache.alloc().unwrap();
        assert!(cache.contains(obj));
        assert_eq!(obj.as_ptr() as usize % 8, 0);
        assert!(seen.insert(obj.as_ptr() as usize), "address handed out twice");
        objs.push(obj);
    }

    let info = cache.info();
    assert!(info.total_objects >= 1000);
    assert_eq!(info.objects_per_slab, 59);

    for obj in objs {
        unsafe { cache.free(obj) };
    }
}

#[test]
fn test_free_all_then_shrink_releases_every_slab() {
    let fx = Fixture::single_node(1024);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("objects-64", 64, 0, SlabFlags::empty(), None)
        .unwrap();

    let objs: Vec<_> = (0..500).map(|_| cache.alloc().unwrap()).collect();
    assert!(fx.pages.used_pages() > 0);
    for obj in objs.into_iter().rev() {
        unsafe { cache.free(obj) };
    }

    assert!(fx.registry.shrink_cache(&cache));
    let info = cache.info();
    assert_eq!(info.total_slabs, 0);
    assert_eq!(info.active_objects, 0);
    assert_eq!(cache.cpu_cache_avail(0), Some(0));
    assert_eq!(fx.pages.used_pages(), 0);
}

#[test]
fn test_refill_pulls_one_batch() {
    let fx = Fixture::new(
        &[256],
        vec![0],
        SlabConfig {
            stats: true,
            ..SlabConfig::default()
        },
    );
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("batched", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    fx.registry.tune_cache(&cache, 8, 4, 0).unwrap();

    let first = cache.alloc().unwrap();
    // One batch of 4 left the slabs, one of them was handed out
    assert_eq!(cache.stats().unwrap().allocations, 4);
    assert_eq!(cache.cpu_cache_avail(0), Some(3));

    let mut objs = vec![first];
    for _ in 0..4 {
        objs.push(cache.alloc().unwrap());
    }
    let stats = cache.stats().unwrap();
    assert_eq!(stats.allocations, 8);
    assert_eq!(stats.alloc_hit, 3);
    assert_eq!(stats.alloc_miss, 2);
    assert_eq!(cache.cpu_cache_avail(0), Some(3));

    for obj in objs {
        unsafe { cache.free(obj) };
    }
    assert_eq!(cache.cpu_cache_avail(0), Some(8));
    assert_eq!(cache.stats().unwrap().free_hit, 5);
}

#[test]
fn test_idle_front_end_refill_is_capped() {
    let fx = Fixture::new(
        &[256],
        vec![0],
        SlabConfig {
            stats: true,
            ..SlabConfig::default()
        },
    );
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("capped", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    assert_eq!(cache.info().batch, 60);

    // The node starts dry; the refill after growth still takes at most 16
    let first = cache.alloc().unwrap();
    assert_eq!(cache.cpu_cache_avail(0), Some(15));
    assert_eq!(cache.stats().unwrap().allocations, 16);

    // Now touched: the next refill takes what the slab has left
    let rest: Vec<_> = (0..16).map(|_| cache.alloc().unwrap()).collect();
    assert_eq!(cache.stats().unwrap().allocations, 59);
    assert_eq!(cache.cpu_cache_avail(0), Some(42));

    unsafe { cache.free(first) };
    for obj in rest {
        unsafe { cache.free(obj) };
    }
}

#[test]
fn test_full_front_end_flushes_oldest_batch() {
    let fx = Fixture::new(
        &[256],
        vec![0],
        SlabConfig {
            stats: true,
            ..SlabConfig::default()
        },
    );
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("flushing", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    fx.registry.tune_cache(&cache, 8, 4, 0).unwrap();

    let objs: Vec<_> = (0..9).map(|_| cache.alloc().unwrap()).collect();
    for obj in objs {
        unsafe { cache.free(obj) };
    }
    // Three refills pulled 12 objects; the sixth free found the front-end
    // full and pushed the 4 oldest back to the slabs
    assert_eq!(cache.cpu_cache_avail(0), Some(8));
    let stats = cache.stats().unwrap();
    assert_eq!(stats.allocations, 12);
    assert_eq!(stats.free_miss, 1);
    assert_eq!(stats.free_hit, 8);
    assert_eq!(stats.active, 8);
}

#[test]
fn test_round_trip_keeps_slab_shape() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("round-trip", 200, 0, SlabFlags::empty(), None)
        .unwrap();

    let held: Vec<_> = (0..30).map(|_| cache.alloc().unwrap()).collect();
    let before = slab_shape(&cache);
    for _ in 0..1000 {
        let obj = cache.alloc().unwrap();
        unsafe { cache.free(obj) };
    }
    assert_eq!(slab_shape(&cache), before);

    for obj in held {
        unsafe { cache.free(obj) };
    }
}

#[test]
fn test_grown_slabs_rotate_colour() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    let cache = fx
        .registry
        .create_cache("coloured", 256, 0, SlabFlags::empty(), None)
        .unwrap();
    let geo = *cache.geometry();
    assert_eq!(geo.colour_count, 2);
    assert_eq!(geo.pages_per_slab(), 1);

    // No front-end: each slab fills completely before the next one grows
    let objs: Vec<_> = (0..3 * geo.objects_per_slab)
        .map(|_| cache.alloc().unwrap())
        .collect();
    let first_offsets: Vec<_> = objs
        .chunks(geo.objects_per_slab)
        .map(|slab| {
            slab.iter()
                .map(|obj| obj.as_ptr() as usize % PAGE_SIZE)
                .min()
                .unwrap()
        })
        .collect();
    let expected: Vec<_> = (0..3)
        .map(|i| (i % geo.colour_count) * geo.colour_off + geo.mgmt_size)
        .collect();
    assert_eq!(first_offsets, expected);
    assert_eq!(first_offsets, vec![120, 184, 120]);

    for obj in objs {
        unsafe { cache.free(obj) };
    }
}

#[test]
fn test_shrink_is_idempotent() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("shrinkable", 128, 0, SlabFlags::empty(), None)
        .unwrap();

    let objs: Vec<_> = (0..100).map(|_| cache.alloc().unwrap()).collect();
    let kept = objs[0];
    for obj in objs.into_iter().skip(1) {
        unsafe { cache.free(obj) };
    }

    assert!(!fx.registry.shrink_cache(&cache));
    let shape = slab_shape(&cache);
    assert!(!fx.registry.shrink_cache(&cache));
    assert_eq!(slab_shape(&cache), shape);
    assert_eq!(cache.info().total_slabs, 1);

    unsafe { cache.free(kept) };
    assert!(fx.registry.shrink_cache(&cache));
    assert!(fx.registry.shrink_cache(&cache));
    assert_eq!(cache.info().total_slabs, 0);
}

#[test]
fn test_page_sized_objects() {
    let fx = Fixture::single_node(1024);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    for size in [PAGE_SIZE, 2 * PAGE_SIZE, PAGE_SIZE + 8] {
        let cache = fx
            .registry
            .create_cache("big", size, 0, SlabFlags::empty(), None)
            .unwrap();
        assert!(cache.geometry().objects_per_slab >= 1);

        let a = cache.alloc().unwrap();
        let b = cache.alloc().unwrap();
        assert_ne!(a, b);
        unsafe {
            core::ptr::write_bytes(a.as_ptr(), 0x5a, size);
            core::ptr::write_bytes(b.as_ptr(), 0xa5, size);
            cache.free(a);
            cache.free(b);
        }
        fx.registry.destroy_cache(&cache).unwrap();
    }
    // Off-slab descriptors went back to the generic caches
    for generic in fx.registry.caches() {
        assert!(fx.registry.shrink_cache(&generic));
    }
    assert_eq!(fx.pages.used_pages(), 0);
}

#[test]
fn test_off_slab_descriptors_come_from_generic_cache() {
    let fx = Fixture::single_node(1024);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("off-slab", 1024, 0, SlabFlags::empty(), None)
        .unwrap();
    assert!(cache.geometry().off_slab);

    let meta = fx.registry.generic_cache(cache.geometry().mgmt_size).unwrap();
    let objs: Vec<_> = (0..10).map(|_| cache.alloc().unwrap()).collect();
    assert!(meta.info().active_objects > 0);
    for obj in objs {
        unsafe { cache.free(obj) };
    }
    assert!(fx.registry.shrink_cache(&cache));

    let (result, pages, _heaps) = fx.teardown();
    assert_eq!(result, Ok(()));
    assert_eq!(pages.used_pages(), 0);
}

#[test]
fn test_destroy_busy_cache_keeps_it_registered() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("busy", 96, 0, SlabFlags::empty(), None)
        .unwrap();
    let obj = cache.alloc().unwrap();

    assert_eq!(fx.registry.destroy_cache(&cache), Err(AllocError::CacheBusy));
    assert!(fx
        .registry
        .caches()
        .iter()
        .any(|c| std::sync::Arc::ptr_eq(c, &cache)));

    // Still usable after the failed destroy
    let other = cache.alloc().unwrap();
    unsafe {
        cache.free(other);
        cache.free(obj);
    }
    assert_eq!(fx.registry.destroy_cache(&cache), Ok(()));
    assert!(!fx
        .registry
        .caches()
        .iter()
        .any(|c| std::sync::Arc::ptr_eq(c, &cache)));
}

#[test]
fn test_generic_caches_cannot_be_destroyed() {
    let fx = Fixture::single_node(64);
    let generic = fx.registry.generic_cache(100).unwrap();
    assert_eq!(generic.name(), "size-128");
    assert_eq!(
        fx.registry.destroy_cache(&generic),
        Err(AllocError::InvalidParam)
    );
}

#[test]
fn test_create_cache_rejects_bad_parameters() {
    let fx = Fixture::single_node(64);
    let registry = &fx.registry;
    assert_eq!(
        registry.create_cache("tiny", 1, 0, SlabFlags::empty(), None).err(),
        Some(AllocError::InvalidParam)
    );
    assert_eq!(
        registry
            .create_cache("huge", (PAGE_SIZE << 10) + 1, 0, SlabFlags::empty(), None)
            .err(),
        Some(AllocError::InvalidParam)
    );
    assert_eq!(
        registry.create_cache("odd-align", 64, 24, SlabFlags::empty(), None).err(),
        Some(AllocError::InvalidParam)
    );

    fx.topology.set_atomic(true);
    assert_eq!(
        registry.create_cache("atomic", 64, 0, SlabFlags::empty(), None).err(),
        Some(AllocError::AtomicContext)
    );
    fx.topology.set_atomic(false);
    assert!(registry.create_cache("fine", 64, 0, SlabFlags::empty(), None).is_ok());
}

static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);

fn fill_pattern(obj: NonNull<u8>) {
    CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
    unsafe { core::ptr::write_bytes(obj.as_ptr(), 0xab, 48) };
}

#[test]
fn test_constructor_runs_once_per_object_at_growth() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("constructed", 48, 0, SlabFlags::empty(), Some(fill_pattern))
        .unwrap();
    let per_slab = cache.geometry().objects_per_slab;

    let obj = cache.alloc().unwrap();
    assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), per_slab);
    assert_eq!(unsafe { *obj.as_ptr() }, 0xab);

    unsafe { cache.free(obj) };
    let again = cache.alloc().unwrap();
    assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), per_slab);

    let zeroed = cache.alloc_flags(AllocFlags::ZERO).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(zeroed.as_ptr(), 48) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe {
        cache.free(again);
        cache.free(zeroed);
    }
}

#[test]
fn test_exhaustion_reports_no_memory() {
    let fx = Fixture::single_node(4);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("page-objects", PAGE_SIZE, 0, SlabFlags::empty(), None)
        .unwrap();

    let mut objs = Vec::new();
    loop {
        match cache.alloc() {
            Ok(obj) => objs.push(obj),
            Err(e) => {
                assert_eq!(e, AllocError::NoMemory);
                break;
            }
        }
        assert!(objs.len() <= 4);
    }
    assert!(!objs.is_empty());
    for obj in objs {
        unsafe { cache.free(obj) };
    }
    // Memory comes back and allocation works again
    let obj = cache.alloc().unwrap();
    unsafe { cache.free(obj) };
}

#[test]
fn test_registry_free_finds_owning_cache() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let a = fx
        .registry
        .create_cache("first", 40, 0, SlabFlags::empty(), None)
        .unwrap();
    let b = fx
        .registry
        .create_cache("second", 400, 0, SlabFlags::empty(), None)
        .unwrap();

    let x = a.alloc().unwrap();
    let y = b.alloc().unwrap();
    assert!(std::sync::Arc::ptr_eq(&fx.registry.cache_of(x).unwrap(), &a));
    assert!(std::sync::Arc::ptr_eq(&fx.registry.cache_of(y).unwrap(), &b));
    unsafe {
        fx.registry.free(x).unwrap();
        fx.registry.free(y).unwrap();
    }

    let mut outside = 0u64;
    let stray = NonNull::from(&mut outside).cast::<u8>();
    assert_eq!(unsafe { fx.registry.free(stray) }, Err(AllocError::NotAllocated));

    assert!(fx.registry.shrink_cache(&a));
    assert!(fx.registry.shrink_cache(&b));
}

#[test]
fn test_unregistered_cpu_allocates_directly_from_node() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    let cache = fx
        .registry
        .create_cache("direct", 64, 0, SlabFlags::empty(), None)
        .unwrap();

    let obj = cache.alloc().unwrap();
    assert_eq!(cache.cpu_cache_avail(0), None);
    assert_eq!(cache.info().active_objects, 1);
    unsafe { cache.free(obj) };
    assert_eq!(cache.info().active_objects, 0);
    assert_eq!(cache.info().nodes[0].free_objects, 59);
}
