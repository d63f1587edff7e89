//! A map from `i64` keys to values that defers building a hash table until
//! its content needs one.
//!
//! Many maps built from query results hold a single value shared by every key
//! (or by a bulk-loaded key list). [`LongKeyMap`] keeps such content as a key
//! list plus one value, and only materializes a real bucket table once keys
//! start mapping to different values.

mod key_array;

use self::key_array::{KeyArray, OverflowOrder, Sortedness};
use crate::common::{
    chain::{self, Chains},
    constants::{threshold_for, LOAD_FACTOR, LONG_MAP_MIN_CAPACITY, MAX_LAZY_SINGLE_KEYS},
};

use std::{fmt, mem, sync::Arc};

/// What the caller knows about a key list handed to
/// [`LongKeyMap::put_multi_rows`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum KeyOrder {
    /// The list may contain duplicates and may be in any order.
    #[default]
    Unknown,
    /// The keys are distinct.
    Unique,
    /// The keys are distinct and ascending.
    UniqueSorted,
}

/// A key not yet folded into the key list of a lazy map.
#[derive(Clone, Copy, Debug)]
struct Overflow {
    key: i64,
    order: OverflowOrder,
}

struct LongEntry<V> {
    key: i64,
    value: V,
}

enum Storage<V> {
    Empty,
    /// Every key maps to `value`.
    Lazy {
        keys: KeyArray,
        value: V,
        overflow: Option<Overflow>,
    },
    Materialized(LongTable<V>),
}

/// A map from `i64` keys to values of type `V`.
///
/// Until it materializes, the map stores its keys as one list sharing a single
/// value:
///
/// - The first `put` into an empty map stores a one-key list.
/// - A `put` of an equal value (as decided by `PartialEq`) with a new key parks
///   the key in a one-key overflow slot. While the map holds fewer than three
///   keys, the key parked before joins the list to make room.
/// - [`put_multi_rows`](#method.put_multi_rows) into an empty map adopts the
///   caller's key list without copying it, when the keys are declared distinct.
///
/// A different value, one key too many, or a `remove` builds the bucket
/// table. From then on, the map behaves like a regular hash map.
///
/// [`sorted_key_array`](#method.sorted_key_array) returns the keys in
/// ascending order and caches the result, so asking twice does not sort twice.
///
/// # Synchronization
///
/// Every mutator takes `&mut self`. Share a `LongKeyMap` between threads by
/// wrapping it in a lock.
///
/// # Examples
///
/// ```rust
/// use softcache::{KeyOrder, LongKeyMap};
///
/// let mut map = LongKeyMap::new();
/// map.put_multi_rows(vec![10, 20, 30], "row", KeyOrder::UniqueSorted);
/// assert_eq!(map.get(20), Some(&"row"));
/// assert!(!map.is_materialized());
///
/// map.put(20, "other row");
/// assert!(map.is_materialized());
/// assert_eq!(*map.sorted_key_array(), vec![10, 20, 30]);
/// ```
pub struct LongKeyMap<V> {
    storage: Storage<V>,
    initial_capacity: usize,
}

impl<V> Default for LongKeyMap<V>
where
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for LongKeyMap<V>
where
    V: fmt::Debug + Clone + PartialEq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<V> LongKeyMap<V>
where
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::with_capacity(LONG_MAP_MIN_CAPACITY)
    }

    /// Creates a map whose bucket table, once materialized, starts with at
    /// least `capacity` buckets.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Storage::Empty,
            initial_capacity: capacity.max(LONG_MAP_MIN_CAPACITY),
        }
    }

    /// Maps `key` to `value`, returning the previous value of `key`.
    pub fn put(&mut self, key: i64, value: V) -> Option<V> {
        let previous = match self.put_lazily(key, value) {
            Ok(previous) => previous,
            Err(value) => {
                self.materialize(1);
                self.table_mut().insert(key, value)
            }
        };
        self.validate();
        previous
    }

    /// Maps every key of `keys` to `value`.
    ///
    /// When the map is empty and `order` declares the keys distinct, the map
    /// adopts `keys` as its key list without copying it. Otherwise the keys are
    /// inserted one by one, a later duplicate overwriting an earlier one.
    pub fn put_multi_rows(&mut self, keys: impl Into<Arc<Vec<i64>>>, value: V, order: KeyOrder) {
        let keys = keys.into();
        match keys.len() {
            0 => return,
            1 => {
                self.put(keys[0], value);
                return;
            }
            _ => {}
        }

        if matches!(self.storage, Storage::Empty) && order != KeyOrder::Unknown {
            let sortedness = match order {
                KeyOrder::UniqueSorted => Sortedness::Sorted,
                _ => Sortedness::Unknown { deferrals: 0 },
            };
            self.storage = Storage::Lazy {
                keys: KeyArray::shared(keys, sortedness),
                value,
                overflow: None,
            };
        } else {
            self.materialize(keys.len());
            let table = self.table_mut();
            for &key in keys.iter() {
                table.insert(key, value.clone());
            }
        }
        self.validate();
    }

    pub fn get(&self, key: i64) -> Option<&V> {
        match &self.storage {
            Storage::Empty => None,
            Storage::Lazy {
                keys,
                value,
                overflow,
            } => {
                let found = keys.contains(key) || matches!(overflow, Some(o) if o.key == key);
                found.then_some(value)
            }
            Storage::Materialized(table) => table.get(key),
        }
    }

    pub fn contains_key(&self, key: i64) -> bool {
        self.get(key).is_some()
    }

    /// Removes `key`, returning its value. Removing a present key materializes
    /// the map.
    pub fn remove(&mut self, key: i64) -> Option<V> {
        if !self.contains_key(key) {
            return None;
        }
        self.materialize(0);
        let removed = self.table_mut().remove(key);
        self.validate();
        removed
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Empty => 0,
            Storage::Lazy { keys, overflow, .. } => keys.len() + usize::from(overflow.is_some()),
            Storage::Materialized(table) => table.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, dropping the bucket table if any.
    pub fn clear(&mut self) {
        self.storage = Storage::Empty;
    }

    /// Returns the keys in ascending order.
    ///
    /// The sorted list is kept until the key set changes. The returned list is
    /// shared with the map: a later mutation copies it first, so the caller's
    /// list never changes under its feet.
    pub fn sorted_key_array(&mut self) -> Arc<Vec<i64>> {
        let shared = match self.key_array_mut() {
            Some(keys) => {
                keys.sort();
                keys.to_shared()
            }
            None => return Arc::default(),
        };
        self.validate();
        shared
    }

    /// Sorts the key list unless its order was never checked and this is one
    /// of the first two requests since. Returns `true` if the key list is
    /// sorted afterwards.
    pub fn sort_if_needed(&mut self) -> bool {
        let sorted = self.key_array_mut().map_or(true, KeyArray::sort_if_needed);
        self.validate();
        sorted
    }

    /// Returns `true` if the keys are known to be in ascending order.
    pub fn is_key_array_sorted(&self) -> bool {
        match &self.storage {
            Storage::Empty => true,
            Storage::Lazy { keys, overflow, .. } => {
                keys.is_sorted()
                    && overflow.map_or(true, |o| o.order == OverflowOrder::Larger)
            }
            Storage::Materialized(table) => table.keys.as_ref().map_or(false, KeyArray::is_sorted),
        }
    }

    /// Returns `true` if the map has built its bucket table.
    pub fn is_materialized(&self) -> bool {
        matches!(self.storage, Storage::Materialized(_))
    }

    /// An iterator visiting all key-value pairs in arbitrary order.
    pub fn iter(&self) -> Iter<'_, V> {
        let inner = match &self.storage {
            Storage::Empty => IterInner::Empty,
            Storage::Lazy {
                keys,
                value,
                overflow,
            } => IterInner::Lazy {
                keys: keys.as_slice().iter(),
                overflow: overflow.map(|o| o.key),
                value,
            },
            Storage::Materialized(table) => IterInner::Materialized(table.chains.iter()),
        };
        Iter { inner }
    }

    /// An iterator visiting all keys in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.iter().map(|(key, _)| key)
    }
}

//
// private
//
impl<V> LongKeyMap<V>
where
    V: Clone + PartialEq,
{
    /// Stores `key` without building the bucket table if possible. Hands
    /// `value` back otherwise.
    fn put_lazily(&mut self, key: i64, value: V) -> Result<Option<V>, V> {
        match &mut self.storage {
            Storage::Empty => {}
            Storage::Lazy {
                keys,
                value: shared,
                overflow,
            } => {
                if *shared != value {
                    return Err(value);
                }
                if keys.contains(key) || matches!(overflow, Some(o) if o.key == key) {
                    return Ok(Some(mem::replace(shared, value)));
                }
                match *overflow {
                    None => {}
                    Some(pending) if keys.len() + 2 <= MAX_LAZY_SINGLE_KEYS => {
                        keys.push(pending.key, pending.order);
                    }
                    Some(_) => return Err(value),
                }
                *overflow = Some(Overflow {
                    key,
                    order: keys.order_of(key),
                });
                return Ok(None);
            }
            Storage::Materialized(_) => return Err(value),
        }

        self.storage = Storage::Lazy {
            keys: KeyArray::single(key),
            value,
            overflow: None,
        };
        Ok(None)
    }

    /// Builds the bucket table with room for `additional` more keys, replaying
    /// the lazily stored keys into it.
    fn materialize(&mut self, additional: usize) {
        let table = match mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Materialized(table) => table,
            Storage::Empty => LongTable::with_capacity(self.initial_capacity.max(capacity_for(additional))),
            Storage::Lazy {
                keys,
                value,
                overflow,
            } => {
                let len = keys.len() + usize::from(overflow.is_some());
                let capacity = self.initial_capacity.max(capacity_for(len + additional));
                let mut table = LongTable::with_capacity(capacity);
                for &key in keys.as_slice() {
                    table.insert(key, value.clone());
                }
                if let Some(o) = overflow {
                    table.insert(o.key, value);
                } else {
                    table.keys = Some(keys);
                }

                #[cfg(feature = "logging")]
                log::trace!("Materialized a long key map of {len} keys, {capacity} buckets");

                table
            }
        };
        self.storage = Storage::Materialized(table);
    }

    fn table_mut(&mut self) -> &mut LongTable<V> {
        match &mut self.storage {
            Storage::Materialized(table) => table,
            _ => panic!("Bug: the long key map is not materialized"),
        }
    }

    /// Returns the full key list, folding a pending overflow key into it or
    /// collecting it from the bucket table. `None` if the map is empty.
    fn key_array_mut(&mut self) -> Option<&mut KeyArray> {
        match &mut self.storage {
            Storage::Empty => None,
            Storage::Lazy { keys, overflow, .. } => {
                if let Some(o) = overflow.take() {
                    keys.push(o.key, o.order);
                }
                Some(keys)
            }
            Storage::Materialized(table) => Some(table.key_array()),
        }
    }

    #[cfg(debug_assertions)]
    fn validate(&self) {
        match &self.storage {
            Storage::Empty => {}
            Storage::Lazy { keys, overflow, .. } => {
                assert!(keys.len() > 0, "Bug: lazy long key map without keys");
                if keys.is_sorted() {
                    assert_ascending(keys.as_slice());
                }
                if let (Some(o), Some(last)) = (overflow, keys.last()) {
                    assert!(!keys.contains(o.key), "Bug: overflow key {} is also listed", o.key);
                    match o.order {
                        OverflowOrder::Larger => assert!(keys.is_sorted() && o.key > last),
                        OverflowOrder::Smaller => assert!(o.key < last),
                        OverflowOrder::Unknown => {}
                    }
                }
            }
            Storage::Materialized(table) => {
                assert_eq!(table.chains.count_reachable(), table.chains.len());
                if let Some(keys) = &table.keys {
                    assert_eq!(keys.len(), table.chains.len(), "Bug: stale key list");
                    if keys.is_sorted() {
                        assert_ascending(keys.as_slice());
                    }
                }
            }
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn validate(&self) {}
}

#[cfg(debug_assertions)]
fn assert_ascending(keys: &[i64]) {
    assert!(
        keys.windows(2).all(|w| w[0] < w[1]),
        "Bug: a key list flagged as sorted is out of order"
    );
}

fn capacity_for(len: usize) -> usize {
    (len as f64 / LOAD_FACTOR) as usize + 1
}

#[inline]
fn hash_key(key: i64) -> u64 {
    let key = key as u64;
    key ^ (key >> 32)
}

/// The materialized form: a chained hash table plus an optional cached list of
/// all its keys.
struct LongTable<V> {
    chains: Chains<LongEntry<V>>,
    threshold: usize,
    keys: Option<KeyArray>,
}

impl<V> LongTable<V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            chains: Chains::with_buckets(capacity),
            threshold: threshold_for(capacity),
            keys: None,
        }
    }

    fn len(&self) -> usize {
        self.chains.len()
    }

    fn get(&self, key: i64) -> Option<&V> {
        let bucket = self.chains.bucket_index(hash_key(key));
        self.chains
            .find(bucket, |e| e.key == key)
            .map(|(_, idx)| &self.chains.get(idx).value)
    }

    fn insert(&mut self, key: i64, value: V) -> Option<V> {
        let bucket = self.chains.bucket_index(hash_key(key));
        if let Some((_, idx)) = self.chains.find(bucket, |e| e.key == key) {
            return Some(mem::replace(&mut self.chains.get_mut(idx).value, value));
        }

        if self.chains.len() >= self.threshold {
            let capacity = self.chains.bucket_count() * 2 + 1;
            self.chains
                .rebuild(capacity, |e| hash_key(e.key), |_| true, |_| {});
            self.threshold = threshold_for(capacity);
        }
        let bucket = self.chains.bucket_index(hash_key(key));
        self.chains.push_front(bucket, LongEntry { key, value });

        // Extend the cached key list, unless a caller holds it.
        let extend = self.keys.as_ref().map_or(false, |keys| !keys.is_shared());
        if extend {
            if let Some(keys) = &mut self.keys {
                let order = keys.order_of(key);
                keys.push(key, order);
            }
        } else {
            self.keys = None;
        }
        None
    }

    fn remove(&mut self, key: i64) -> Option<V> {
        let bucket = self.chains.bucket_index(hash_key(key));
        let (prev, idx) = self.chains.find(bucket, |e| e.key == key)?;
        let entry = self.chains.unlink(bucket, prev, idx);
        self.keys = None;
        Some(entry.value)
    }

    fn key_array(&mut self) -> &mut KeyArray {
        let chains = &self.chains;
        self.keys
            .get_or_insert_with(|| KeyArray::collect(chains.iter().map(|e| e.key)))
    }
}

/// An iterator over the entries of a [`LongKeyMap`].
///
/// This struct is created by the [`iter`](struct.LongKeyMap.html#method.iter)
/// method.
pub struct Iter<'a, V> {
    inner: IterInner<'a, V>,
}

enum IterInner<'a, V> {
    Empty,
    Lazy {
        keys: std::slice::Iter<'a, i64>,
        overflow: Option<i64>,
        value: &'a V,
    },
    Materialized(chain::Iter<'a, LongEntry<V>>),
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (i64, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            IterInner::Empty => None,
            IterInner::Lazy {
                keys,
                overflow,
                value,
            } => keys
                .next()
                .copied()
                .or_else(|| overflow.take())
                .map(|key| (key, *value)),
            IterInner::Materialized(entries) => entries.next().map(|e| (e.key, &e.value)),
        }
    }
}
