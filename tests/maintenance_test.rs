//! Integration tests for tuning, reaping, deferred reclaim and teardown.

mod common;

use common::{set_cpu, Fixture};
use numa_slab_allocator::{AllocError, SlabConfig, SlabFlags, REAP_INTERVAL_MS};

#[test]
fn test_tune_validates_and_resizes_front_ends() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("tunable", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    let info = cache.info();
    assert_eq!((info.limit, info.batch, info.shared), (120, 60, 0));

    for (limit, batch) in [(0, 0), (8, 0), (8, 9)] {
        assert_eq!(
            fx.registry.tune_cache(&cache, limit, batch, 0),
            Err(AllocError::InvalidParam)
        );
    }

    let objs: Vec<_> = (0..30).map(|_| cache.alloc().unwrap()).collect();
    for obj in objs {
        unsafe { cache.free(obj) };
    }
    assert!(cache.cpu_cache_avail(0).unwrap() > 0);

    fx.registry.tune_cache(&cache, 16, 8, 2).unwrap();
    let info = cache.info();
    assert_eq!((info.limit, info.batch, info.shared), (16, 8, 2));
    assert_eq!(info.nodes[0].shared_limit, 16);
    assert_eq!(info.nodes[0].free_limit, 2 * 8 + info.objects_per_slab);
    // Old front-end contents went back to the node
    assert_eq!(cache.cpu_cache_avail(0), Some(0));
    assert_eq!(info.active_objects, 0);
}

#[test]
fn test_second_worker_enables_shared_tier() {
    let fx = Fixture::new(&[256], vec![0, 0], SlabConfig::default());
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("auto", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    let pinned = fx
        .registry
        .create_cache("pinned", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    fx.registry.tune_cache(&pinned, 8, 4, 0).unwrap();
    assert_eq!(cache.info().nodes[0].shared_limit, 0);

    fx.registry.register_worker(1).unwrap();
    let info = cache.info();
    assert_eq!(info.shared, 8);
    assert_eq!(info.nodes[0].shared_limit, 8 * 60);
    assert_eq!(info.nodes[0].free_limit, 3 * 60 + 59);
    // Tuned caches keep their settings
    assert_eq!(pinned.info().nodes[0].shared_limit, 0);
}

#[test]
fn test_reap_trims_idle_front_end() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("reaped", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    fx.registry.tune_cache(&cache, 20, 10, 0).unwrap();

    let objs: Vec<_> = (0..20).map(|_| cache.alloc().unwrap()).collect();
    for obj in objs {
        unsafe { cache.free(obj) };
    }
    assert_eq!(cache.cpu_cache_avail(0), Some(20));

    // A touched front-end only loses its flag
    assert!(fx.registry.reap(0, 0));
    assert_eq!(cache.cpu_cache_avail(0), Some(20));
    // Idle: drop (limit + 4) / 5 at a time
    assert!(fx.registry.reap(0, REAP_INTERVAL_MS));
    assert_eq!(cache.cpu_cache_avail(0), Some(16));
    assert!(fx.registry.reap(0, 2 * REAP_INTERVAL_MS));
    assert_eq!(cache.cpu_cache_avail(0), Some(12));
}

#[test]
fn test_reap_releases_surplus_empty_slabs() {
    let fx = Fixture::new(
        &[256],
        vec![0],
        SlabConfig {
            stats: true,
            ..SlabConfig::default()
        },
    );
    set_cpu(0);
    let cache = fx
        .registry
        .create_cache("trimmed", 64, 0, SlabFlags::empty(), None)
        .unwrap();

    // No front-end: objects go straight back into their slabs
    let objs: Vec<_> = (0..59).map(|_| cache.alloc().unwrap()).collect();
    for obj in objs {
        unsafe { cache.free(obj) };
    }
    assert_eq!(cache.info().nodes[0].empty_slabs, 1);

    // Registration lets the cpu reap; the empty list was just used
    fx.registry.register_worker(0).unwrap();
    assert!(fx.registry.reap(0, 0));
    assert_eq!(cache.info().nodes[0].empty_slabs, 1);

    // Before the node interval nothing is trimmed
    assert!(fx.registry.reap(0, 1000));
    assert_eq!(cache.info().nodes[0].empty_slabs, 1);

    assert!(fx.registry.reap(0, 4000));
    assert_eq!(cache.info().nodes[0].empty_slabs, 0);
    assert_eq!(cache.stats().unwrap().reaped, 1);
    assert_eq!(fx.pages.used_pages(), 0);
}

#[test]
fn test_reap_skips_unregistered_cpu() {
    let fx = Fixture::single_node(64);
    assert!(!fx.registry.reap(0, 0));
    assert!(!fx.registry.reap(99, 0));
}

#[test]
fn test_deferred_slabs_wait_for_grace_period() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("rcu", 256, 0, SlabFlags::DESTROY_BY_RCU, None)
        .unwrap();

    let objs: Vec<_> = (0..40).map(|_| cache.alloc().unwrap()).collect();
    let slabs = cache.info().total_slabs;
    for obj in objs {
        unsafe { cache.free(obj) };
    }
    assert!(fx.registry.shrink_cache(&cache));

    let info = cache.info();
    assert_eq!(info.total_slabs, 0);
    assert_eq!(info.deferred_slabs, slabs);
    // Pages stay out until the grace period ends
    assert_eq!(fx.pages.used_pages(), slabs * info.pages_per_slab);

    assert_eq!(fx.registry.complete_grace_period(), slabs);
    assert_eq!(cache.info().deferred_slabs, 0);
    assert_eq!(fx.pages.used_pages(), 0);
    assert_eq!(fx.registry.complete_grace_period(), 0);
}

#[test]
fn test_destroy_completes_deferred_reclaim() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("rcu-destroy", 128, 0, SlabFlags::DESTROY_BY_RCU, None)
        .unwrap();
    let obj = cache.alloc().unwrap();
    unsafe { cache.free(obj) };

    fx.registry.destroy_cache(&cache).unwrap();
    assert_eq!(fx.pages.used_pages(), 0);
}

#[test]
fn test_rcu_and_poison_are_exclusive() {
    let fx = Fixture::single_node(64);
    assert_eq!(
        fx.registry
            .create_cache(
                "bad",
                64,
                0,
                SlabFlags::DESTROY_BY_RCU | SlabFlags::POISON,
                None
            )
            .err(),
        Some(AllocError::InvalidParam)
    );
}

#[test]
fn test_stats_follow_object_churn() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let plain = fx
        .registry
        .create_cache("plain", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    assert!(plain.stats().is_none());

    let cache = fx
        .registry
        .create_cache("counted", 64, 0, SlabFlags::STATS, None)
        .unwrap();
    fx.registry.tune_cache(&cache, 4, 2, 0).unwrap();
    let objs: Vec<_> = (0..10).map(|_| cache.alloc().unwrap()).collect();
    let stats = cache.stats().unwrap();
    assert_eq!(stats.grown, 1);
    assert_eq!(stats.active, 10);
    assert_eq!(stats.high_mark, 10);

    for obj in objs {
        unsafe { cache.free(obj) };
    }
    assert!(fx.registry.shrink_cache(&cache));
    let stats = cache.stats().unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.high_mark, 10);
    assert_eq!(stats.errors, 0);
}

#[test]
fn test_teardown_refuses_live_objects() {
    let fx = Fixture::single_node(256);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    let cache = fx
        .registry
        .create_cache("leaky", 64, 0, SlabFlags::empty(), None)
        .unwrap();
    let _leaked = cache.alloc().unwrap();
    drop(cache);

    let (result, pages, _heaps) = fx.teardown();
    assert_eq!(result, Err(AllocError::CacheBusy));
    assert_eq!(pages.used_pages(), 1);
}

#[test]
fn test_teardown_returns_all_pages() {
    let fx = Fixture::single_node(1024);
    set_cpu(0);
    fx.registry.register_worker(0).unwrap();
    for size in [24, 100, 700, 3000] {
        let cache = fx
            .registry
            .create_cache("churn", size, 0, SlabFlags::HWCACHE_ALIGN, None)
            .unwrap();
        let objs: Vec<_> = (0..50).map(|_| cache.alloc().unwrap()).collect();
        for obj in objs {
            unsafe { cache.free(obj) };
        }
    }
    assert!(fx.pages.used_pages() > 0);

    let (result, pages, _heaps) = fx.teardown();
    assert_eq!(result, Ok(()));
    assert_eq!(pages.used_pages(), 0);
}
