use crate::common::constants::MAX_SORT_DEFERRALS;

use std::sync::Arc;

/// What is known about the order of a key array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Sortedness {
    /// Ascending, no duplicates.
    Sorted,
    /// Known to be out of order.
    Unsorted,
    /// Never checked. `deferrals` counts the sort requests answered without
    /// sorting so far.
    Unknown { deferrals: u8 },
}

/// Where a pending overflow key sits relative to the tail of a key array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OverflowOrder {
    Larger,
    Smaller,
    Unknown,
}

/// A list of distinct keys, possibly shared with callers.
///
/// Mutation copies the list first when a caller still holds it.
#[derive(Clone, Debug)]
pub(crate) struct KeyArray {
    keys: Arc<Vec<i64>>,
    order: Sortedness,
}

impl KeyArray {
    pub(crate) fn single(key: i64) -> Self {
        Self {
            keys: Arc::new(vec![key]),
            order: Sortedness::Sorted,
        }
    }

    /// Wraps a caller's list without copying it. The keys must be distinct.
    pub(crate) fn shared(keys: Arc<Vec<i64>>, order: Sortedness) -> Self {
        Self { keys, order }
    }

    /// Collects `keys`, whose order is not known.
    pub(crate) fn collect(keys: impl IntoIterator<Item = i64>) -> Self {
        Self {
            keys: Arc::new(keys.into_iter().collect()),
            order: Sortedness::Unknown { deferrals: 0 },
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[i64] {
        &self.keys
    }

    pub(crate) fn is_sorted(&self) -> bool {
        self.order == Sortedness::Sorted
    }

    /// Returns `true` if a caller still holds this list.
    pub(crate) fn is_shared(&self) -> bool {
        Arc::strong_count(&self.keys) > 1
    }

    pub(crate) fn last(&self) -> Option<i64> {
        self.keys.last().copied()
    }

    /// Binary search when the list is known to be sorted, linear scan
    /// otherwise.
    pub(crate) fn contains(&self, key: i64) -> bool {
        if self.is_sorted() {
            self.keys.binary_search(&key).is_ok()
        } else {
            self.keys.contains(&key)
        }
    }

    /// Tells where `key` would land relative to the tail.
    pub(crate) fn order_of(&self, key: i64) -> OverflowOrder {
        match (self.order, self.last()) {
            (Sortedness::Sorted, Some(last)) if key > last => OverflowOrder::Larger,
            (_, Some(last)) if key < last => OverflowOrder::Smaller,
            _ => OverflowOrder::Unknown,
        }
    }

    /// Appends a key that is not in the list yet. `order` is where it lands
    /// relative to the current tail.
    pub(crate) fn push(&mut self, key: i64, order: OverflowOrder) {
        debug_assert!(!self.keys.contains(&key));
        self.order = match (self.order, order) {
            (Sortedness::Sorted, OverflowOrder::Larger) => Sortedness::Sorted,
            (_, OverflowOrder::Smaller) | (Sortedness::Unsorted, _) => Sortedness::Unsorted,
            _ => Sortedness::Unknown { deferrals: 0 },
        };
        Arc::make_mut(&mut self.keys).push(key);
    }

    /// Sorts the list if it is not known to be sorted. A list never checked
    /// before is only inspected, and copied only if it is out of order.
    pub(crate) fn sort(&mut self) {
        match self.order {
            Sortedness::Sorted => {}
            Sortedness::Unknown { .. } if is_ascending(&self.keys) => {
                self.order = Sortedness::Sorted;
            }
            _ => {
                Arc::make_mut(&mut self.keys).sort_unstable();
                self.order = Sortedness::Sorted;
            }
        }
    }

    /// Sorts the list unless its order is unknown and fewer than
    /// `MAX_SORT_DEFERRALS` requests were deferred already. Returns `true` if
    /// the list is sorted afterwards.
    pub(crate) fn sort_if_needed(&mut self) -> bool {
        match self.order {
            Sortedness::Sorted => true,
            Sortedness::Unknown { deferrals } if deferrals < MAX_SORT_DEFERRALS => {
                self.order = Sortedness::Unknown {
                    deferrals: deferrals + 1,
                };
                false
            }
            _ => {
                self.sort();
                true
            }
        }
    }

    pub(crate) fn to_shared(&self) -> Arc<Vec<i64>> {
        Arc::clone(&self.keys)
    }
}

fn is_ascending(keys: &[i64]) -> bool {
    keys.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod tests {
    use super::{KeyArray, OverflowOrder, Sortedness};
    use std::sync::Arc;

    #[test]
    fn push_tracks_the_order() {
        let mut keys = KeyArray::single(10);
        assert_eq!(keys.order_of(20), OverflowOrder::Larger);
        keys.push(20, OverflowOrder::Larger);
        assert!(keys.is_sorted());

        assert_eq!(keys.order_of(5), OverflowOrder::Smaller);
        keys.push(5, OverflowOrder::Smaller);
        assert_eq!(keys.order, Sortedness::Unsorted);
        assert!(keys.contains(5));
        assert!(!keys.contains(7));

        keys.sort();
        assert_eq!(keys.as_slice(), &[5, 10, 20]);
        assert!(keys.contains(20));
    }

    #[test]
    fn mutation_copies_a_shared_list() {
        let caller = Arc::new(vec![3, 1, 2]);
        let mut keys = KeyArray::shared(Arc::clone(&caller), Sortedness::Unsorted);
        assert!(keys.is_shared());

        keys.sort();
        assert_eq!(keys.as_slice(), &[1, 2, 3]);
        assert_eq!(*caller, vec![3, 1, 2]);
        assert!(!keys.is_shared());
    }

    #[test]
    fn ascending_unknown_list_is_not_copied() {
        let caller = Arc::new(vec![1, 2, 3]);
        let mut keys = KeyArray::shared(Arc::clone(&caller), Sortedness::Unknown { deferrals: 0 });
        keys.sort();
        assert!(keys.is_sorted());
        assert!(Arc::ptr_eq(&keys.to_shared(), &caller));
    }

    #[test]
    fn sort_is_deferred_twice() {
        let mut keys = KeyArray::collect([4, 2, 9]);
        assert!(!keys.sort_if_needed());
        assert!(!keys.sort_if_needed());
        assert_eq!(keys.as_slice(), &[4, 2, 9]);
        assert!(keys.sort_if_needed());
        assert_eq!(keys.as_slice(), &[2, 4, 9]);

        // A list known to be out of order is sorted right away.
        let mut keys = KeyArray::single(8);
        keys.push(1, OverflowOrder::Smaller);
        assert!(keys.sort_if_needed());
        assert_eq!(keys.as_slice(), &[1, 8]);
    }
}
