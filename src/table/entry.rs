use crate::common::time::{pack_tick, UNSET_TICK};

use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Weak,
    },
};

/// How a table node holds its value.
pub(crate) enum Referent<V> {
    /// The value is held weakly. `hard` is the table's own strong hold, which
    /// eviction may drop without unlinking the node.
    Weak { weak: Weak<V>, hard: Option<Arc<V>> },
    /// The value is held strongly for the whole life of the node.
    Locked(Arc<V>),
}

/// A node of a cache table's bucket chains.
pub(crate) struct Entry<K, V> {
    hash: u64,
    key: K,
    referent: Referent<V>,
    /// The last-accessed tick with the low bit cleared.
    data: AtomicI64,
}

impl<K, V> Entry<K, V> {
    /// Creates a weak entry that starts with a hard hold on `value`.
    pub(crate) fn new_cache(hash: u64, key: K, value: Arc<V>) -> Self {
        Self {
            hash,
            key,
            referent: Referent::Weak {
                weak: Arc::downgrade(&value),
                hard: Some(value),
            },
            data: AtomicI64::new(UNSET_TICK),
        }
    }

    pub(crate) fn new_locked(hash: u64, key: K, value: Arc<V>) -> Self {
        Self {
            hash,
            key,
            referent: Referent::Locked(value),
            data: AtomicI64::new(UNSET_TICK),
        }
    }

    #[inline]
    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Returns the value, or `None` if a weakly held value has been dropped.
    pub(crate) fn get(&self) -> Option<Arc<V>> {
        match &self.referent {
            Referent::Weak { hard: Some(v), .. } => Some(Arc::clone(v)),
            Referent::Weak { weak, hard: None } => weak.upgrade(),
            Referent::Locked(v) => Some(Arc::clone(v)),
        }
    }

    #[inline]
    pub(crate) fn data(&self) -> i64 {
        self.data.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_data(&self, tick: i64) {
        self.data.store(pack_tick(tick), Ordering::Relaxed);
    }

    pub(crate) fn is_locked(&self) -> bool {
        matches!(self.referent, Referent::Locked(_))
    }

    pub(crate) fn has_hard_reference(&self) -> bool {
        match &self.referent {
            Referent::Weak { hard, .. } => hard.is_some(),
            Referent::Locked(_) => true,
        }
    }

    /// Drops the table's own hard hold on the value. Returns `true` if a hold
    /// was dropped. Locked entries keep their value.
    pub(crate) fn clear_hard_reference(&mut self) -> bool {
        match &mut self.referent {
            Referent::Weak { hard, .. } => hard.take().is_some(),
            Referent::Locked(_) => false,
        }
    }

    /// Returns `true` if the value is gone: nothing holds it strongly anymore.
    pub(crate) fn is_reclaimed(&self) -> bool {
        match &self.referent {
            Referent::Weak { weak, .. } => weak.strong_count() == 0,
            Referent::Locked(_) => false,
        }
    }

    /// Returns `true` if the value counts as allocated by this table: it is
    /// still alive and the table holds it strongly.
    pub(crate) fn is_allocated(&self) -> bool {
        !self.is_reclaimed() && self.has_hard_reference()
    }
}

impl<K, V> PartialEq for Entry<K, V> {
    fn eq(&self, other: &Self) -> bool {
        let same_referent = match (&self.referent, &other.referent) {
            (Referent::Weak { weak: a, .. }, Referent::Weak { weak: b, .. }) => Weak::ptr_eq(a, b),
            (Referent::Locked(a), Referent::Locked(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_referent && self.hash == other.hash
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Entry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("hash", &self.hash)
            .field("key", &self.key)
            .field("locked", &self.is_locked())
            .field("hard", &self.has_hard_reference())
            .field("reclaimed", &self.is_reclaimed())
            .field("data", &self.data())
            .finish()
    }
}
