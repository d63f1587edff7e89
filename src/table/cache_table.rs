use super::{entry::Entry, CacheTableBuilder};
use crate::{
    authority::{CacheId, Evictable, MemoryAuthority},
    common::{
        chain::Chains,
        constants::{
            threshold_for, FULL_CLEAR_PERCENT, LOAD_FACTOR, MIN_CAPACITY, OVERHEAD_ELEMENT,
            POINTER_SIZE, TIDY_UP_PERCENT,
        },
        error::{check_average_size, check_percent},
        time::UNSET_TICK,
    },
    tidy_up::TidyUpScheduler,
    ConfigError, Cost,
};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Weak,
    },
};

/// A thread-safe cache that releases a computed share of its content when the
/// process runs short of memory.
///
/// Values are stored as `Arc<V>`. A regular entry holds its value weakly plus
/// a _hard_ hold of its own. An eviction pass drops hard holds and unlinks
/// nodes, oldest access first, until the share asked for by the memory
/// authority is released. A _locked_ entry (see
/// [`insert_locked`](#method.insert_locked)) always holds its value strongly
/// and is only removed explicitly or by a full clear.
///
/// # Releasing references
///
/// When `may_release_references` is `true` (the default), eviction unlinks
/// nodes even if their values are still used elsewhere. This suits pure
/// caches.
///
/// When it is `false`, eviction of a value still used elsewhere only drops
/// the table's hard hold; the node stays, so a later lookup returns the very
/// same instance. Only nodes whose values are gone are unlinked. Use this for
/// caches that must hand out one authoritative instance per key.
///
/// # Examples
///
/// ```rust
/// use softcache::{CacheTable, Cost};
/// use std::sync::Arc;
///
/// let cache = CacheTable::builder()
///     .name("rows")
///     .cost(Cost::Low)
///     .average_size(256)
///     .build()
///     .unwrap();
///
/// let row = cache.insert(1_u64, "first row".to_string());
/// assert!(Arc::ptr_eq(&cache.get(&1).unwrap(), &row));
///
/// // Release half of the content.
/// let released = cache.free_memory(0.5).unwrap();
/// assert!(released > 0);
/// ```
pub struct CacheTable<K, V, S = RandomState> {
    inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> Clone for CacheTable<K, V, S> {
    /// Makes a clone of this shared cache.
    ///
    /// This operation is cheap as it only creates thread-safe reference counted
    /// pointers to the shared internal data structures.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, S> fmt::Debug for CacheTable<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("CacheTable")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("cost", &self.inner.cost)
            .field("len", &state.chains.len())
            .field("unallocated", &state.unallocated)
            .field("capacity", &state.chains.bucket_count())
            .finish()
    }
}

/// The values a [`CacheTableBuilder`] hands over to the table.
pub(crate) struct TableConfig {
    pub(crate) name: Option<String>,
    pub(crate) cost: Cost,
    pub(crate) average_size: i64,
    pub(crate) may_release_references: bool,
    pub(crate) initial_capacity: usize,
    pub(crate) register_threshold: usize,
    pub(crate) authority: Arc<dyn MemoryAuthority>,
    pub(crate) scheduler: Arc<TidyUpScheduler>,
}

struct Inner<K, V, S> {
    id: CacheId,
    name: Option<String>,
    cost: Cost,
    may_release_references: bool,
    initial_capacity: usize,
    register_threshold: usize,
    build_hasher: S,
    authority: Arc<dyn MemoryAuthority>,
    scheduler: Arc<TidyUpScheduler>,
    this: Weak<Inner<K, V, S>>,
    state: RwLock<TableState<K, V>>,
    first_accessed: CachePadded<AtomicI64>,
    last_accessed: CachePadded<AtomicI64>,
    registered: AtomicBool,
    registered_for_tidy_up: AtomicBool,
}

struct TableState<K, V> {
    chains: Chains<Entry<K, V>>,
    /// Approximate number of nodes whose value is gone or whose hard hold was
    /// dropped. Never larger than the node count.
    unallocated: usize,
    hash_threshold: usize,
    average_size: u32,
}

impl<K, V, S> Drop for Inner<K, V, S> {
    fn drop(&mut self) {
        if self.registered.swap(false, Ordering::AcqRel) {
            self.authority.deregister(self.id);
        }
    }
}

impl<K, V> CacheTable<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Constructs a `CacheTable` with the default configuration, registered
    /// with the process-wide memory registry and tidy-up scheduler.
    pub fn new() -> Self {
        Self::builder()
            .build()
            .expect("Bug: the default configuration is invalid")
    }

    /// Returns a [`CacheTableBuilder`], which can build a `CacheTable` with
    /// various configuration knobs.
    pub fn builder() -> CacheTableBuilder<K, V, CacheTable<K, V, RandomState>> {
        CacheTableBuilder::default()
    }
}

impl<K, V> Default for CacheTable<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

//
// public
//
impl<K, V, S> CacheTable<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn with_config(config: TableConfig, build_hasher: S) -> Result<Self, ConfigError> {
        let average_size = check_average_size(config.average_size)?;
        if config.register_threshold == 0 {
            return Err(ConfigError::ZeroRegisterThreshold);
        }
        let capacity = config.initial_capacity.max(MIN_CAPACITY);

        let inner = Arc::new_cyclic(|this| Inner {
            id: CacheId::new(),
            name: config.name,
            cost: config.cost.normalize(),
            may_release_references: config.may_release_references,
            initial_capacity: capacity,
            register_threshold: config.register_threshold,
            build_hasher,
            authority: config.authority,
            scheduler: config.scheduler,
            this: this.clone(),
            state: RwLock::new(TableState {
                chains: Chains::with_buckets(capacity),
                unallocated: 0,
                hash_threshold: threshold_for(capacity),
                average_size,
            }),
            first_accessed: CachePadded::new(AtomicI64::new(UNSET_TICK)),
            last_accessed: CachePadded::new(AtomicI64::new(UNSET_TICK)),
            registered: AtomicBool::new(false),
            registered_for_tidy_up: AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    /// Returns the id under which this cache registers with the memory
    /// authority and the tidy-up scheduler.
    pub fn id(&self) -> CacheId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Returns the cost tier of this cache. Never `Cost::Panic`.
    pub fn cost(&self) -> Cost {
        self.inner.cost
    }

    pub fn may_release_references(&self) -> bool {
        self.inner.may_release_references
    }

    /// Returns the value for the key, and stamps the entry as accessed now.
    ///
    /// The key may be any borrowed form of the cache's key type, but `Hash` and `Eq`
    /// on the borrowed form _must_ match those for the key type.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.inner.hash(key);
        let state = self.inner.state.read();
        let bucket = state.chains.bucket_index(hash);
        let (_, idx) = state
            .chains
            .find(bucket, |e| e.hash() == hash && e.key().borrow() == key)?;
        let entry = state.chains.get(idx);
        let value = entry.get()?;
        self.inner.touch(entry);
        Some(value)
    }

    /// Returns `true` if the cache holds a live value for the key. Does not
    /// stamp the entry.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.inner.hash(key);
        let state = self.inner.state.read();
        let bucket = state.chains.bucket_index(hash);
        state
            .chains
            .find(bucket, |e| e.hash() == hash && e.key().borrow() == key)
            .map(|(_, idx)| !state.chains.get(idx).is_reclaimed())
            .unwrap_or_default()
    }

    /// Returns `true` if any live value of the cache equals `value`.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let state = self.inner.state.read();
        let found = state
            .chains
            .iter()
            .any(|e| e.get().map(|v| *v == *value).unwrap_or_default());
        found
    }

    /// Inserts a value held weakly plus a hard hold, replacing any entry for
    /// the key. Returns the shared handle to the value.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.insert_arc(key, Arc::clone(&value));
        value
    }

    /// Like [`insert`](#method.insert), for a value that is already shared.
    /// Returns the value previously stored for the key, if it was still alive.
    pub fn insert_arc(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let hash = self.inner.hash(&key);
        self.inner.insert_entry(Entry::new_cache(hash, key, value))
    }

    /// Inserts a value held strongly for as long as the entry exists.
    /// Eviction passes never drop it. Returns the shared handle to the value.
    pub fn insert_locked(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let hash = self.inner.hash(&key);
        self.inner
            .insert_entry(Entry::new_locked(hash, key, Arc::clone(&value)));
        value
    }

    /// Removes the entry for the key. Returns its value if it was still alive.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.inner.hash(key);
        let removed = {
            let mut state = self.inner.state.write();
            let bucket = state.chains.bucket_index(hash);
            let (prev, idx) = state
                .chains
                .find(bucket, |e| e.hash() == hash && e.key().borrow() == key)?;
            let entry = state.chains.unlink(bucket, prev, idx);
            if !entry.is_allocated() {
                state.forget_unallocated(1);
            }
            state.clamp_unallocated();
            entry
        };
        self.inner.check_register();
        removed.get()
    }

    /// Unlinks every entry and shrinks the bucket array back to its initial
    /// size.
    pub fn clear(&self) {
        let victims = self.inner.state.write().reset(self.inner.initial_capacity);
        self.inner.first_accessed.store(UNSET_TICK, Ordering::Release);
        drop(victims);
        self.inner.check_register();
    }

    /// Shrinks the bucket array to fit the current entries, never below the
    /// minimum capacity, and unlinks the entries whose values are gone.
    pub fn compact(&self) {
        let victims = {
            let mut state = self.inner.state.write();
            let target = ((state.chains.len() as f64 / LOAD_FACTOR) as usize + 1).max(MIN_CAPACITY);
            let capacity = target.min(state.chains.bucket_count());
            state.rehash(capacity)
        };
        drop(victims);
        self.inner.check_register();
    }

    /// Returns the number of entries, including the ones whose values are gone
    /// but that have not been unlinked yet.
    pub fn len(&self) -> usize {
        self.inner.state.read().chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the length of the bucket array.
    pub fn capacity(&self) -> usize {
        self.inner.state.read().chains.bucket_count()
    }

    /// Returns the approximate number of entries not counted as allocated:
    /// their values are gone or their hard holds were dropped. Recomputed by
    /// eviction passes only.
    pub fn unallocated(&self) -> usize {
        self.inner.state.read().unallocated
    }

    pub fn average_size(&self) -> u32 {
        self.inner.state.read().average_size
    }

    /// Sets the estimated size in bytes of one value.
    pub fn set_average_size(&self, size: i64) -> Result<(), ConfigError> {
        let size = check_average_size(size)?;
        self.inner.state.write().average_size = size;
        Ok(())
    }

    /// Returns the estimated number of bytes held by this cache.
    pub fn estimated_size(&self) -> u64 {
        self.inner.state.read().estimated_size()
    }

    /// Returns the tick of the most recent access, or `i64::MIN` if the cache
    /// has never been accessed.
    pub fn last_accessed(&self) -> i64 {
        let _state = self.inner.state.read();
        self.inner.last_accessed.load(Ordering::Acquire)
    }

    /// Returns the lower bound of the access window the eviction heuristic
    /// works on, or `i64::MIN` if the cache has not been accessed since it was
    /// created or cleared.
    pub fn first_accessed(&self) -> i64 {
        self.inner.first_accessed.load(Ordering::Acquire)
    }

    /// Releases `percent` of the content. `percent` must be within
    /// `(0.0, 1.0]`. Returns the released bytes.
    pub fn free_memory(&self, percent: f64) -> Result<u64, ConfigError> {
        self.inner.free_memory(percent)
    }

    /// Runs the eviction pass for `percent` of the content synchronously.
    /// See [`Evictable::queued_free_memory`].
    pub fn queued_free_memory(&self, percent: f64) -> Result<u64, ConfigError> {
        self.inner.queued_free_memory(percent)
    }

    /// Releases everything that can be released.
    pub fn panic_free_memory(&self) -> u64 {
        self.inner.panic_free_memory()
    }

    /// Runs a small eviction pass. Normally called by the tidy-up worker.
    pub fn tidy_up(&self) -> u64 {
        self.inner.tidy_up()
    }

    /// Queues this cache with its tidy-up scheduler. Returns `false` if it is
    /// already queued.
    pub fn request_tidy_up(&self) -> bool {
        self.inner.request_tidy_up()
    }

    /// Returns `true` if this cache is registered with its memory authority.
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    pub fn is_registered_for_tidy_up(&self) -> bool {
        self.inner.registered_for_tidy_up.load(Ordering::Acquire)
    }

    /// Registers with the memory authority once the allocated entries exceed
    /// the register threshold, and deregisters when they fall back below.
    pub fn check_register(&self) {
        self.inner.check_register();
    }
}

//
// private
//
impl<K, V, S> Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    #[inline]
    fn hash<Q>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Stamps the entry with the current tick and widens the access window.
    fn touch(&self, entry: &Entry<K, V>) {
        let now = self.authority.last_tick();
        entry.set_data(now);
        self.last_accessed.fetch_max(now, Ordering::AcqRel);
        let _ = self.first_accessed.compare_exchange(
            UNSET_TICK,
            now,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn insert_entry(&self, entry: Entry<K, V>) -> Option<Arc<V>> {
        self.touch(&entry);
        let hash = entry.hash();
        let (old, victims) = {
            let mut state = self.state.write();
            let mut bucket = state.chains.bucket_index(hash);

            let found = state
                .chains
                .find(bucket, |e| e.hash() == hash && e.key() == entry.key());
            if let Some((_, idx)) = found {
                let old = std::mem::replace(state.chains.get_mut(idx), entry);
                if !old.is_allocated() {
                    state.forget_unallocated(1);
                }
                (Some(old), Vec::new())
            } else {
                let mut victims = Vec::new();
                if state.chains.len() >= state.hash_threshold {
                    let capacity = state.chains.bucket_count() * 2 + 1;
                    victims = state.rehash(capacity);
                    bucket = state.chains.bucket_index(hash);
                }
                state.chains.push_front(bucket, entry);
                (None, victims)
            }
        };
        drop(victims);
        self.check_register();
        old.and_then(|e| e.get())
    }

    fn check_register(&self) {
        let live = {
            let state = self.state.read();
            state.allocated_count()
        };
        if live > self.register_threshold {
            if !self.registered.swap(true, Ordering::AcqRel) {
                let this: Weak<dyn Evictable> = self.this.clone();
                self.authority.register(self.id, this);

                #[cfg(feature = "logging")]
                log::debug!("{}Registered with the memory authority ({live} live objects)", self.log_prefix());
            }
        } else if self.registered.swap(false, Ordering::AcqRel) {
            self.authority.deregister(self.id);

            #[cfg(feature = "logging")]
            log::debug!("{}Deregistered from the memory authority ({live} live objects)", self.log_prefix());
        }
    }

    fn request_tidy_up(&self) -> bool {
        if self.registered_for_tidy_up.swap(true, Ordering::AcqRel) {
            return false;
        }
        let this: Weak<dyn Evictable> = self.this.clone();
        if self.scheduler.register(this) {
            true
        } else {
            self.registered_for_tidy_up.store(false, Ordering::Release);
            false
        }
    }

    /// The eviction pass. `percent` must already be validated.
    fn release(&self, percent: f64) -> u64 {
        let (released, victims) = {
            let mut state = self.state.write();
            let size_before = state.estimated_size();

            if self.may_release_references && percent > FULL_CLEAR_PERCENT {
                let victims = state.reset(self.initial_capacity);
                self.first_accessed.store(UNSET_TICK, Ordering::Release);

                #[cfg(feature = "logging")]
                log::debug!(
                    "{}Cleared {} entries to release {percent}: {size_before} bytes",
                    self.log_prefix(),
                    victims.len()
                );

                (size_before, victims)
            } else {
                self.release_oldest(&mut state, percent, size_before)
            }
        };
        drop(victims);
        self.check_register();
        released
    }

    fn release_oldest(
        &self,
        state: &mut TableState<K, V>,
        percent: f64,
        size_before: u64,
    ) -> (u64, Vec<Entry<K, V>>) {
        let mut last = self.last_accessed.load(Ordering::Acquire);
        if last == UNSET_TICK {
            last = self.authority.last_tick();
        }
        let mut first = self.first_accessed.load(Ordering::Acquire);
        if first == UNSET_TICK || first > last {
            first = last;
        }
        let lower_limit = first + ((last - first) as f64 * percent).round() as i64 + 1;
        let required = state.required_to_clear(percent);

        let may_release = self.may_release_references;
        let mut remaining = state.chains.len();
        let mut freed = 0usize;
        let mut unallocated = 0usize;
        let mut temp_first_accessed = i64::MAX;
        let mut victims = Vec::new();

        state.chains.retain(
            |entry| {
                let forced = required >= remaining + freed;
                remaining -= 1;

                if entry.is_reclaimed() {
                    freed += 1;
                    return false;
                }
                let candidate = !entry.is_locked()
                    && (forced || (freed < required && entry.data() <= lower_limit));
                if candidate {
                    if may_release {
                        freed += 1;
                        return false;
                    }
                    if entry.clear_hard_reference() {
                        freed += 1;
                        if entry.is_reclaimed() {
                            return false;
                        }
                    }
                }
                if !entry.is_allocated() {
                    unallocated += 1;
                }
                temp_first_accessed = temp_first_accessed.min(entry.data());
                true
            },
            |entry| victims.push(entry),
        );
        state.unallocated = unallocated;
        state.clamp_unallocated();

        self.first_accessed
            .store(temp_first_accessed.max(lower_limit), Ordering::Release);

        let size_after = state.estimated_size();
        let released = if size_before > size_after {
            size_before - size_after
        } else {
            freed as u64 * state.average_size as u64
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "{}Released {percent}: freed {freed} of {required} required entries, {released} bytes",
            self.log_prefix()
        );

        (released, victims)
    }

    #[cfg(feature = "logging")]
    fn log_prefix(&self) -> String {
        match &self.name {
            Some(name) => format!("[{name}] "),
            None => format!("[{:?}] ", self.id),
        }
    }
}

impl<K, V, S> Evictable for Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn id(&self) -> CacheId {
        self.id
    }

    fn cost(&self) -> Cost {
        self.cost
    }

    fn free_memory(&self, percent: f64) -> Result<u64, ConfigError> {
        self.queued_free_memory(percent)
    }

    fn panic_free_memory(&self) -> u64 {
        self.release(1.0)
    }

    fn queued_free_memory(&self, percent: f64) -> Result<u64, ConfigError> {
        let percent = check_percent(percent)?;
        Ok(self.release(percent))
    }

    fn tidy_up(&self) -> u64 {
        self.registered_for_tidy_up.store(false, Ordering::Release);
        self.release(TIDY_UP_PERCENT)
    }

    fn estimated_size(&self) -> u64 {
        self.state.read().estimated_size()
    }

    fn last_accessed(&self) -> i64 {
        self.last_accessed.load(Ordering::Acquire)
    }
}

impl<K, V> TableState<K, V> {
    fn allocated_count(&self) -> usize {
        self.chains
            .len()
            .checked_sub(self.unallocated)
            .expect("Bug: more unallocated entries than entries")
    }

    fn estimated_size(&self) -> u64 {
        let count = self.chains.len() as u64;
        count * OVERHEAD_ELEMENT
            + self.chains.bucket_count() as u64 * POINTER_SIZE
            + self.allocated_count() as u64 * self.average_size as u64
    }

    /// Returns how many entries an eviction pass for `percent` has to free.
    ///
    /// The allocated values, the bucket array and the per-node overhead each
    /// contribute `percent` of their bytes; the sum is converted to entries by
    /// the bytes one freed entry gives back. At least one entry is required.
    fn required_to_clear(&self, percent: f64) -> usize {
        let average_size = self.average_size as f64;
        let objects = self.allocated_count() as f64 * average_size * percent;
        let array = (self.chains.bucket_count() as u64 * POINTER_SIZE) as f64 * percent;
        let overhead = (self.chains.len() as u64 * OVERHEAD_ELEMENT) as f64 * percent;
        let per_entry = average_size + OVERHEAD_ELEMENT as f64;
        let required = ((objects + array + overhead) / per_entry).round() as usize;
        required.max(1)
    }

    /// Re-chains the entries into `capacity` buckets, unlinking the entries
    /// whose values are gone. Returns the unlinked entries.
    fn rehash(&mut self, capacity: usize) -> Vec<Entry<K, V>> {
        let mut victims = Vec::new();
        self.chains.rebuild(
            capacity,
            |e| e.hash(),
            |e| !e.is_reclaimed(),
            |e| victims.push(e),
        );
        self.forget_unallocated(victims.len());
        self.hash_threshold = threshold_for(capacity);
        victims
    }

    /// Empties the table. Returns the unlinked entries, to be dropped after the
    /// lock is released.
    fn reset(&mut self, capacity: usize) -> Vec<Entry<K, V>> {
        let old = std::mem::replace(&mut self.chains, Chains::with_buckets(capacity));
        self.unallocated = 0;
        self.hash_threshold = threshold_for(capacity);
        old.into_items()
    }

    #[inline]
    fn forget_unallocated(&mut self, n: usize) {
        self.unallocated = self.unallocated.saturating_sub(n);
    }

    #[inline]
    fn clamp_unallocated(&mut self) {
        self.unallocated = self.unallocated.min(self.chains.len());
    }
}

#[cfg(test)]
impl<K, V, S> CacheTable<K, V, S> {
    /// Walks every bucket chain and counts the nodes.
    pub(crate) fn count_reachable(&self) -> usize {
        self.inner.state.read().chains.count_reachable()
    }
}
