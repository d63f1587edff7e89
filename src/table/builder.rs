use super::{cache_table::TableConfig, CacheTable};
use crate::{
    authority::{MemoryAuthority, MemoryRegistry},
    common::constants::{DEFAULT_AVERAGE_SIZE, DEFAULT_REGISTER_THRESHOLD, MIN_CAPACITY},
    tidy_up::TidyUpScheduler,
    ConfigError, Cost,
};

use std::{
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    sync::Arc,
};

/// Builds a [`CacheTable`][cache-struct] with various configuration knobs.
///
/// [cache-struct]: ./struct.CacheTable.html
///
/// # Examples
///
/// ```rust
/// use softcache::{CacheTable, Cost};
///
/// let cache = CacheTable::builder()
///     // Identifies the cache in log messages.
///     .name("users")
///     // Drained after `Lowest` and `Low` caches.
///     .cost(Cost::Medium)
///     // One user object is roughly 512 bytes.
///     .average_size(512)
///     // Users must be unique per id: never unlink a user still in use.
///     .may_release_references(false)
///     // Create the cache.
///     .build()
///     .unwrap();
///
/// cache.insert(7_u32, "Alice".to_string());
/// assert!(cache.contains_key(&7));
/// ```
///
pub struct CacheTableBuilder<K, V, C> {
    name: Option<String>,
    cost: Cost,
    average_size: i64,
    may_release_references: bool,
    initial_capacity: Option<usize>,
    register_threshold: usize,
    authority: Option<Arc<dyn MemoryAuthority>>,
    scheduler: Option<Arc<TidyUpScheduler>>,
    cache_type: PhantomData<(K, V, C)>,
}

impl<K, V, C> fmt::Debug for CacheTableBuilder<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTableBuilder")
            .field("name", &self.name)
            .field("cost", &self.cost)
            .field("average_size", &self.average_size)
            .field("may_release_references", &self.may_release_references)
            .field("initial_capacity", &self.initial_capacity)
            .field("register_threshold", &self.register_threshold)
            .finish()
    }
}

impl<K, V> Default for CacheTableBuilder<K, V, CacheTable<K, V, RandomState>>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            name: None,
            cost: Cost::default(),
            average_size: DEFAULT_AVERAGE_SIZE as i64,
            may_release_references: true,
            initial_capacity: None,
            register_threshold: DEFAULT_REGISTER_THRESHOLD,
            authority: None,
            scheduler: None,
            cache_type: PhantomData,
        }
    }
}

impl<K, V> CacheTableBuilder<K, V, CacheTable<K, V, RandomState>>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Builds a `CacheTable<K, V>`.
    ///
    /// # Errors
    ///
    /// Fails if the average size is not positive or the register threshold is
    /// zero.
    pub fn build(self) -> Result<CacheTable<K, V, RandomState>, ConfigError> {
        let build_hasher = RandomState::default();
        self.build_with_hasher(build_hasher)
    }

    /// Builds a `CacheTable<K, V, S>` with the given `hasher`.
    pub fn build_with_hasher<S>(self, hasher: S) -> Result<CacheTable<K, V, S>, ConfigError>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        let config = TableConfig {
            name: self.name,
            cost: self.cost,
            average_size: self.average_size,
            may_release_references: self.may_release_references,
            initial_capacity: self.initial_capacity.unwrap_or(MIN_CAPACITY),
            register_threshold: self.register_threshold,
            authority: self
                .authority
                .unwrap_or_else(|| MemoryRegistry::global() as Arc<dyn MemoryAuthority>),
            scheduler: self.scheduler.unwrap_or_else(TidyUpScheduler::global),
        };
        CacheTable::with_config(config, hasher)
    }
}

impl<K, V, C> CacheTableBuilder<K, V, C> {
    /// Sets the name of the cache, used in log messages.
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the cost tier of the cache. `Cost::Panic` is stored as
    /// `Cost::Highest`.
    pub fn cost(self, cost: Cost) -> Self {
        Self { cost, ..self }
    }

    /// Sets the estimated size in bytes of one value. Must be positive.
    pub fn average_size(self, bytes: i64) -> Self {
        Self {
            average_size: bytes,
            ..self
        }
    }

    /// Sets whether eviction may unlink entries whose values are still used
    /// elsewhere. Default: `true`.
    pub fn may_release_references(self, may_release: bool) -> Self {
        Self {
            may_release_references: may_release,
            ..self
        }
    }

    /// Sets the initial length of the bucket array. Values below the minimum
    /// capacity are raised to it.
    pub fn initial_capacity(self, capacity: usize) -> Self {
        Self {
            initial_capacity: Some(capacity),
            ..self
        }
    }

    /// Sets the number of live objects above which the cache registers with
    /// its memory authority. Must be at least `1`.
    pub fn register_threshold(self, threshold: usize) -> Self {
        Self {
            register_threshold: threshold,
            ..self
        }
    }

    /// Sets the memory authority. Default: [`MemoryRegistry::global`].
    pub fn memory_authority(self, authority: Arc<dyn MemoryAuthority>) -> Self {
        Self {
            authority: Some(authority),
            ..self
        }
    }

    /// Sets the tidy-up scheduler. Default: [`TidyUpScheduler::global`].
    pub fn tidy_up_scheduler(self, scheduler: Arc<TidyUpScheduler>) -> Self {
        Self {
            scheduler: Some(scheduler),
            ..self
        }
    }
}
