//! The contract between caches and the process-wide memory authority.
//!
//! A cache registers itself with a [`MemoryAuthority`] once it holds enough
//! objects to be worth draining, and the authority calls back into the
//! [`Evictable`] surface when memory becomes scarce. The authority also
//! provides the coarse clock used to stamp entry access times.
//!
//! [`MemoryRegistry`] is a simple authority: it keeps weak handles to the
//! registered caches and releases memory from them in ascending order of
//! [`Cost`].

use crate::{
    common::{error::check_percent, time::Clock},
    tidy_up::TidyUpScheduler,
    ConfigError, Cost,
};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};
use uuid::Uuid;

static GLOBAL_REGISTRY: Lazy<Arc<MemoryRegistry>> = Lazy::new(|| Arc::new(MemoryRegistry::new()));

/// Identifies a cache in a memory authority and in a tidy-up scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(Uuid);

impl CacheId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheId({})", self.0.as_simple())
    }
}

/// The callback surface a cache exposes to a memory authority.
pub trait Evictable: Send + Sync {
    fn id(&self) -> CacheId;

    /// Returns the cost tier of this cache. Never `Cost::Panic`.
    fn cost(&self) -> Cost;

    /// Releases `percent` of the content. Returns the released bytes.
    fn free_memory(&self, percent: f64) -> Result<u64, ConfigError>;

    /// Releases everything that can be released. Returns the released bytes.
    fn panic_free_memory(&self) -> u64;

    /// Runs the eviction pass for `percent` of the content synchronously.
    /// Returns the released bytes.
    fn queued_free_memory(&self, percent: f64) -> Result<u64, ConfigError>;

    /// Runs a small, best-effort eviction pass. Returns the released bytes.
    fn tidy_up(&self) -> u64;

    /// Returns the estimated number of bytes held by this cache.
    fn estimated_size(&self) -> u64;

    /// Returns the tick of the most recent successful lookup.
    fn last_accessed(&self) -> i64;
}

/// The process-wide authority deciding when caches must release memory.
pub trait MemoryAuthority: Send + Sync {
    /// Adds a cache to the set of caches to drain under pressure. Registering
    /// an already registered cache has no effect.
    fn register(&self, id: CacheId, cache: Weak<dyn Evictable>);

    /// Removes a cache from the set. Deregistering an unknown cache has no
    /// effect.
    fn deregister(&self, id: CacheId);

    /// Returns the current tick: a coarse, monotonic, millisecond-like time.
    fn last_tick(&self) -> i64;
}

type LiveCaches = SmallVec<[Arc<dyn Evictable>; 8]>;

/// A [`MemoryAuthority`] keeping weak handles to the registered caches.
///
/// The registry does not watch the process memory by itself. Whoever detects
/// pressure calls [`relieve_pressure`](#method.relieve_pressure),
/// [`free_bytes`](#method.free_bytes) or
/// [`schedule_tidy_up`](#method.schedule_tidy_up).
pub struct MemoryRegistry {
    clock: Clock,
    caches: RwLock<HashMap<CacheId, Weak<dyn Evictable>>>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("registered", &self.registered_count())
            .finish()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_clock(Clock::default())
    }

    pub(crate) fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            caches: RwLock::new(HashMap::default()),
        }
    }

    /// Returns the process-wide registry. Caches built without an explicit
    /// authority register here.
    pub fn global() -> Arc<MemoryRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    pub fn registered_count(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_registered(&self, id: CacheId) -> bool {
        self.caches.read().contains_key(&id)
    }

    /// Returns the sum of the estimated sizes of the registered caches.
    pub fn estimated_size(&self) -> u64 {
        self.live_caches()
            .iter()
            .map(|c| c.estimated_size())
            .fold(0u64, u64::saturating_add)
    }

    /// Asks every registered cache to release `percent` of its content, in
    /// ascending order of cost. Returns the total released bytes.
    pub fn relieve_pressure(&self, percent: f64) -> Result<u64, ConfigError> {
        let percent = check_percent(percent)?;
        let mut released = 0u64;
        for cache in self.caches_by_cost() {
            released = released.saturating_add(cache.queued_free_memory(percent)?);
        }

        #[cfg(feature = "logging")]
        log::debug!("Relieved memory pressure of {percent}: released {released} bytes");

        Ok(released)
    }

    /// Releases at least `required` bytes if possible, draining the cheapest
    /// caches first. A cache is only asked for the share of its content still
    /// needed. Returns the total released bytes.
    pub fn free_bytes(&self, required: u64) -> u64 {
        let mut released = 0u64;
        for cache in self.caches_by_cost() {
            if released >= required {
                break;
            }
            let size = cache.estimated_size();
            if size == 0 {
                continue;
            }
            let percent = ((required - released) as f64 / size as f64).min(1.0);
            if let Ok(n) = cache.queued_free_memory(percent) {
                released = released.saturating_add(n);
            }
        }
        released
    }

    /// Releases everything every registered cache can release.
    pub fn panic_free_memory(&self) -> u64 {
        self.caches_by_cost()
            .iter()
            .map(|c| c.panic_free_memory())
            .fold(0u64, u64::saturating_add)
    }

    /// Queues every registered cache for a background tidy-up. Returns the
    /// number of caches that were not queued already.
    pub fn schedule_tidy_up(&self, scheduler: &TidyUpScheduler) -> usize {
        self.live_caches()
            .into_iter()
            .filter(|c| scheduler.register(Arc::downgrade(c)))
            .count()
    }

    fn caches_by_cost(&self) -> LiveCaches {
        let mut caches = self.live_caches();
        caches.sort_by_key(|c| c.cost());
        caches
    }

    /// Upgrades the registered handles. Handles of dropped caches are pruned.
    ///
    /// The returned caches are called without holding the registry lock, since
    /// an eviction pass may deregister its cache.
    fn live_caches(&self) -> LiveCaches {
        let mut dead = false;
        let live = {
            let caches = self.caches.read();
            caches
                .values()
                .filter_map(|weak| {
                    let cache = weak.upgrade();
                    dead |= cache.is_none();
                    cache
                })
                .collect::<LiveCaches>()
        };
        if dead {
            self.caches.write().retain(|_, weak| weak.strong_count() > 0);
        }
        live
    }
}

impl MemoryAuthority for MemoryRegistry {
    fn register(&self, id: CacheId, cache: Weak<dyn Evictable>) {
        self.caches.write().entry(id).or_insert(cache);
    }

    fn deregister(&self, id: CacheId) {
        self.caches.write().remove(&id);
    }

    fn last_tick(&self) -> i64 {
        self.clock.tick()
    }
}
