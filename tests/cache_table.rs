use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Weak,
    },
    thread,
};

use parking_lot::Mutex;
use paste::paste;
use softcache::{CacheId, CacheTable, Evictable, MemoryAuthority, TidyUpScheduler};

const NUM_THREADS: u64 = 8;

/// A memory authority whose clock only moves when a test says so.
#[derive(Default)]
struct ManualAuthority {
    tick: AtomicI64,
    caches: Mutex<HashMap<CacheId, Weak<dyn Evictable>>>,
}

impl ManualAuthority {
    fn set_tick(&self, tick: i64) {
        self.tick.store(tick, Ordering::Release);
    }

    fn is_registered(&self, id: CacheId) -> bool {
        self.caches.lock().contains_key(&id)
    }
}

impl MemoryAuthority for ManualAuthority {
    fn register(&self, id: CacheId, cache: Weak<dyn Evictable>) {
        self.caches.lock().insert(id, cache);
    }

    fn deregister(&self, id: CacheId) {
        self.caches.lock().remove(&id);
    }

    fn last_tick(&self) -> i64 {
        self.tick.load(Ordering::Acquire)
    }
}

fn new_cache(authority: &Arc<ManualAuthority>, may_release: bool) -> CacheTable<u64, String> {
    CacheTable::builder()
        .average_size(100)
        .may_release_references(may_release)
        .memory_authority(Arc::clone(authority) as Arc<dyn MemoryAuthority>)
        .tidy_up_scheduler(Arc::new(TidyUpScheduler::new()))
        .build()
        .expect("valid configuration")
}

/// Inserts keys `0..n`, key `k` stamped at tick `k`.
fn fill(authority: &ManualAuthority, cache: &CacheTable<u64, String>, n: u64) {
    for key in 0..n {
        authority.set_tick(key as i64);
        cache.insert(key, format!("value-{key}"));
    }
}

// The values are not held outside the cache, so both modes unlink the same
// entries.
macro_rules! generate_eviction_tests {
    ($name:ident, $may_release:expr) => {
        paste! {
            #[test]
            fn [<$name _half_eviction_takes_the_oldest_half>]() {
                let authority = Arc::new(ManualAuthority::default());
                let cache = new_cache(&authority, $may_release);
                fill(&authority, &cache, 1_000);

                let released = cache.queued_free_memory(0.5).unwrap();
                assert!(released > 0);

                for key in 0..=500 {
                    assert!(!cache.contains_key(&key), "key {key} survived");
                }
                assert!(cache.first_accessed() >= 500);
                assert!(cache.len() < 500);
            }

            #[test]
            fn [<$name _eviction_is_monotone_in_the_percentage>]() {
                let mut previous = 0;
                for percent in [0.01, 0.05, 0.2, 0.4, 0.6, 0.8, 0.9] {
                    let authority = Arc::new(ManualAuthority::default());
                    let cache = new_cache(&authority, $may_release);
                    fill(&authority, &cache, 400);
                    cache.queued_free_memory(percent).unwrap();

                    let evicted = 400 - cache.len();
                    assert!(evicted >= previous, "{percent}: {evicted} < {previous}");
                    previous = evicted;
                }
            }

            #[test]
            fn [<$name _count_matches_the_reachable_entries>]() {
                let authority = Arc::new(ManualAuthority::default());
                let cache = new_cache(&authority, $may_release);
                fill(&authority, &cache, 2_000);
                for key in (0..2_000).step_by(7) {
                    cache.remove(&key);
                }
                cache.queued_free_memory(0.3).unwrap();
                cache.compact();

                let reachable = (0..2_000).filter(|key| cache.contains_key(key)).count();
                assert_eq!(cache.len(), reachable);
            }
        }
    };
}

generate_eviction_tests!(releasing, true);
generate_eviction_tests!(keeping, false);

#[test]
fn full_eviction_returns_the_previous_size() -> anyhow::Result<()> {
    let authority = Arc::new(ManualAuthority::default());
    let cache = new_cache(&authority, true);
    fill(&authority, &cache, 300);
    let size = cache.estimated_size();

    assert_eq!(cache.queued_free_memory(0.91)?, size);
    assert!(cache.is_empty());
    assert_eq!(cache.first_accessed(), i64::MIN);
    Ok(())
}

#[test]
fn held_values_keep_their_identity() -> anyhow::Result<()> {
    let authority = Arc::new(ManualAuthority::default());
    let cache = new_cache(&authority, false);

    let held = (0..100)
        .map(|key| {
            authority.set_tick(key as i64);
            (key, cache.insert(key, format!("user-{key}")))
        })
        .collect::<Vec<_>>();

    cache.queued_free_memory(1.0)?;
    assert_eq!(cache.len(), 100);
    for (key, value) in &held {
        let fetched = cache.get(key).expect("held value must stay reachable");
        assert!(Arc::ptr_eq(&fetched, value));
    }
    Ok(())
}

#[test]
fn registers_with_a_custom_authority() {
    let authority = Arc::new(ManualAuthority::default());
    let cache: CacheTable<u64, u64> = CacheTable::builder()
        .register_threshold(5)
        .memory_authority(Arc::clone(&authority) as Arc<dyn MemoryAuthority>)
        .build()
        .unwrap();

    for key in 0..6 {
        cache.insert(key, key);
    }
    assert!(authority.is_registered(cache.id()));

    // The authority drives the eviction through the trait object.
    let registered = authority
        .caches
        .lock()
        .get(&cache.id())
        .and_then(Weak::upgrade)
        .expect("registered cache is alive");
    assert_eq!(registered.estimated_size(), cache.estimated_size());
    assert!(registered.panic_free_memory() > 0);
    drop(registered);
    assert!(!authority.is_registered(cache.id()));
}

#[test]
fn concurrent_access() {
    let _ = env_logger::builder().is_test(true).try_init();

    let authority = Arc::new(ManualAuthority::default());
    let cache = new_cache(&authority, true);

    let threads = (0..NUM_THREADS)
        .map(|thread_id| {
            let cache = cache.clone();
            let authority = Arc::clone(&authority);
            thread::spawn(move || {
                for i in 0..500 {
                    let key = thread_id * 1_000 + i;
                    authority.set_tick(key as i64);
                    cache.insert(key, format!("{thread_id}-{i}"));
                    let _ = cache.get(&key);
                    if i % 100 == 99 {
                        cache.queued_free_memory(0.1).unwrap();
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    threads
        .into_iter()
        .for_each(|t| t.join().expect("Thread failed"));

    let reachable = (0..NUM_THREADS)
        .flat_map(|t| (0..500).map(move |i| t * 1_000 + i))
        .filter(|key| cache.contains_key(key))
        .count();
    assert_eq!(cache.len(), reachable);
    assert!(cache.len() < 500 * NUM_THREADS as usize);
}
