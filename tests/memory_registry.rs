use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use softcache::{CacheTable, Cost, MemoryAuthority, MemoryRegistry, TidyUpScheduler};

struct Caches {
    registry: Arc<MemoryRegistry>,
    scheduler: Arc<TidyUpScheduler>,
    low: CacheTable<u32, String>,
    high: CacheTable<u32, String>,
}

fn setup() -> Caches {
    let registry = Arc::new(MemoryRegistry::new());
    let scheduler = Arc::new(TidyUpScheduler::new());
    let build = |name: &str, cost: Cost| {
        let cache: CacheTable<u32, String> = CacheTable::builder()
            .name(name)
            .cost(cost)
            .average_size(100)
            .register_threshold(10)
            .memory_authority(Arc::clone(&registry) as Arc<dyn MemoryAuthority>)
            .tidy_up_scheduler(Arc::clone(&scheduler))
            .build()
            .expect("valid configuration");
        for key in 0..100 {
            cache.insert(key, format!("{name}-{key}"));
        }
        cache
    };
    let low = build("low", Cost::Low);
    let high = build("high", Cost::High);
    Caches {
        registry,
        scheduler,
        low,
        high,
    }
}

#[test]
fn tracks_registered_caches() {
    let caches = setup();
    assert_eq!(caches.registry.registered_count(), 2);
    assert_eq!(
        caches.registry.estimated_size(),
        caches.low.estimated_size() + caches.high.estimated_size()
    );

    let Caches { registry, high, .. } = caches;
    drop(high);
    assert_eq!(registry.registered_count(), 1);
}

#[test]
fn small_requests_only_touch_the_cheapest_cache() {
    let caches = setup();
    let released = caches.registry.free_bytes(1_000);
    assert!(released >= 1_000);
    assert!(caches.low.len() < 100);
    assert_eq!(caches.high.len(), 100);
}

#[test]
fn relieve_pressure_shrinks_every_cache() -> anyhow::Result<()> {
    let caches = setup();
    let before = caches.registry.estimated_size();

    let released = caches.registry.relieve_pressure(0.5)?;
    assert!(released > 0);
    assert!(caches.low.len() < 100);
    assert!(caches.high.len() < 100);
    assert_eq!(caches.registry.estimated_size(), before - released);
    Ok(())
}

#[test]
fn panic_free_memory_empties_every_cache() {
    let caches = setup();
    assert!(caches.registry.panic_free_memory() > 0);
    assert!(caches.low.is_empty());
    assert!(caches.high.is_empty());
    // Empty caches deregister themselves.
    assert_eq!(caches.registry.registered_count(), 0);
}

#[test]
fn scheduled_tidy_ups_run_in_the_background() {
    let caches = setup();
    assert_eq!(caches.registry.schedule_tidy_up(&caches.scheduler), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    while caches.scheduler.completed_passes() < 2 {
        assert!(Instant::now() < deadline, "tidy-up passes did not run");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(caches.low.len() < 100);
    assert!(caches.high.len() < 100);
}
