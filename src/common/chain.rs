//! Hash bucket chains stored in an index arena.
//!
//! Every node lives in a slot of one `Vec` and links to the next node of its
//! bucket by index. Unlinking a node is an index rewrite on its predecessor,
//! and a freed slot is recycled through a free list.

pub(crate) type NodeIndex = u32;

enum Slot<T> {
    Occupied { item: T, next: Option<NodeIndex> },
    Vacant,
}

pub(crate) struct Chains<T> {
    buckets: Vec<Option<NodeIndex>>,
    slots: Vec<Slot<T>>,
    free: Vec<NodeIndex>,
    len: usize,
}

impl<T> Chains<T> {
    pub(crate) fn with_buckets(bucket_count: usize) -> Self {
        assert!(bucket_count > 0);
        Self {
            buckets: vec![None; bucket_count],
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Returns the number of linked nodes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn bucket_index(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    /// Links `item` at the head of `bucket` and returns its index.
    pub(crate) fn push_front(&mut self, bucket: usize, item: T) -> NodeIndex {
        let next = self.buckets[bucket];
        let idx = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                if matches!(slot, Slot::Occupied { .. }) {
                    panic!("Bug: free list handed out the live node {idx}");
                }
                *slot = Slot::Occupied { item, next };
                idx
            }
            None => {
                let idx = NodeIndex::try_from(self.slots.len())
                    .expect("Bug: chain arena exceeded u32::MAX nodes");
                self.slots.push(Slot::Occupied { item, next });
                idx
            }
        };
        self.buckets[bucket] = Some(idx);
        self.len += 1;
        idx
    }

    #[inline]
    pub(crate) fn get(&self, idx: NodeIndex) -> &T {
        match &self.slots[idx as usize] {
            Slot::Occupied { item, .. } => item,
            Slot::Vacant => panic!("Bug: node {idx} is not linked"),
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, idx: NodeIndex) -> &mut T {
        match &mut self.slots[idx as usize] {
            Slot::Occupied { item, .. } => item,
            Slot::Vacant => panic!("Bug: node {idx} is not linked"),
        }
    }

    #[inline]
    fn next_of(&self, idx: NodeIndex) -> Option<NodeIndex> {
        match &self.slots[idx as usize] {
            Slot::Occupied { next, .. } => *next,
            Slot::Vacant => panic!("Bug: node {idx} is not linked"),
        }
    }

    fn set_next(&mut self, idx: NodeIndex, new_next: Option<NodeIndex>) {
        match &mut self.slots[idx as usize] {
            Slot::Occupied { next, .. } => *next = new_next,
            Slot::Vacant => panic!("Bug: node {idx} is not linked"),
        }
    }

    /// Finds the first node of `bucket` matching `pred`. Returns its
    /// predecessor (if any) and its own index.
    pub(crate) fn find(
        &self,
        bucket: usize,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Option<(Option<NodeIndex>, NodeIndex)> {
        let mut prev = None;
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            if pred(self.get(idx)) {
                return Some((prev, idx));
            }
            prev = Some(idx);
            cursor = self.next_of(idx);
        }
        None
    }

    /// Unlinks the node `idx` whose predecessor in `bucket` is `prev`.
    pub(crate) fn unlink(&mut self, bucket: usize, prev: Option<NodeIndex>, idx: NodeIndex) -> T {
        let next = self.next_of(idx);
        match prev {
            Some(p) => {
                debug_assert_eq!(self.next_of(p), Some(idx));
                self.set_next(p, next);
            }
            None => {
                debug_assert_eq!(self.buckets[bucket], Some(idx));
                self.buckets[bucket] = next;
            }
        }
        self.len -= 1;
        self.free.push(idx);
        match std::mem::replace(&mut self.slots[idx as usize], Slot::Vacant) {
            Slot::Occupied { item, .. } => item,
            Slot::Vacant => unreachable!(),
        }
    }

    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            chains: self,
            bucket: 0,
            cursor: None,
        }
    }

    /// Walks every bucket in order and unlinks the nodes for which `keep`
    /// returns `false`. The unlinked items are handed to `removed`.
    pub(crate) fn retain(
        &mut self,
        mut keep: impl FnMut(&mut T) -> bool,
        mut removed: impl FnMut(T),
    ) {
        for bucket in 0..self.buckets.len() {
            let mut prev = None;
            let mut cursor = self.buckets[bucket];
            while let Some(idx) = cursor {
                let next = self.next_of(idx);
                if keep(self.get_mut(idx)) {
                    prev = Some(idx);
                } else {
                    removed(self.unlink(bucket, prev, idx));
                }
                cursor = next;
            }
        }
    }

    /// Re-chains every node into a fresh bucket array of `bucket_count` slots.
    /// Nodes for which `keep` returns `false` are unlinked and handed to
    /// `removed` instead.
    pub(crate) fn rebuild(
        &mut self,
        bucket_count: usize,
        hash_of: impl Fn(&T) -> u64,
        mut keep: impl FnMut(&T) -> bool,
        mut removed: impl FnMut(T),
    ) {
        assert!(bucket_count > 0);
        let old_buckets = std::mem::replace(&mut self.buckets, vec![None; bucket_count]);
        for head in old_buckets {
            let mut cursor = head;
            while let Some(idx) = cursor {
                cursor = self.next_of(idx);
                if keep(self.get(idx)) {
                    let bucket = self.bucket_index(hash_of(self.get(idx)));
                    let next = self.buckets[bucket];
                    self.set_next(idx, next);
                    self.buckets[bucket] = Some(idx);
                } else {
                    self.len -= 1;
                    self.free.push(idx);
                    if let Slot::Occupied { item, .. } =
                        std::mem::replace(&mut self.slots[idx as usize], Slot::Vacant)
                    {
                        removed(item);
                    }
                }
            }
        }
    }

    /// Consumes the arena, returning the linked items.
    pub(crate) fn into_items(self) -> Vec<T> {
        self.slots
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Occupied { item, .. } => Some(item),
                Slot::Vacant => None,
            })
            .collect()
    }

    /// Counts the nodes reachable from the bucket array.
    ///
    /// # Panics
    ///
    /// Panics if a bucket chain loops back on itself.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn count_reachable(&self) -> usize {
        let max_steps = self.slots.len();
        let mut total = 0;
        for head in &self.buckets {
            let mut steps = 0;
            let mut cursor = *head;
            while let Some(idx) = cursor {
                steps += 1;
                if steps > max_steps {
                    panic!("Bug: bucket chain loop detected at node {idx}");
                }
                cursor = self.next_of(idx);
            }
            total += steps;
        }
        total
    }
}

pub(crate) struct Iter<'a, T> {
    chains: &'a Chains<T>,
    bucket: usize,
    cursor: Option<NodeIndex>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(idx) = self.cursor {
                self.cursor = self.chains.next_of(idx);
                return Some(self.chains.get(idx));
            }
            if self.bucket >= self.chains.buckets.len() {
                return None;
            }
            self.cursor = self.chains.buckets[self.bucket];
            self.bucket += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Chains;

    fn insert(chains: &mut Chains<u64>, v: u64) {
        let bucket = chains.bucket_index(v);
        chains.push_front(bucket, v);
    }

    fn remove(chains: &mut Chains<u64>, v: u64) -> Option<u64> {
        let bucket = chains.bucket_index(v);
        chains
            .find(bucket, |x| *x == v)
            .map(|(prev, idx)| chains.unlink(bucket, prev, idx))
    }

    #[test]
    fn push_find_unlink() {
        let mut chains = Chains::with_buckets(3);
        for v in 0..10 {
            insert(&mut chains, v);
        }
        assert_eq!(chains.len(), 10);
        assert_eq!(chains.count_reachable(), 10);

        // 1, 4 and 7 share a bucket; remove the middle one.
        assert_eq!(remove(&mut chains, 4), Some(4));
        assert_eq!(remove(&mut chains, 4), None);
        assert_eq!(chains.len(), 9);
        assert_eq!(chains.count_reachable(), 9);
        assert!(chains.find(1, |x| *x == 1).is_some());
        assert!(chains.find(1, |x| *x == 7).is_some());

        // The freed slot is reused.
        insert(&mut chains, 40);
        assert_eq!(chains.len(), 10);
        let mut all = chains.iter().copied().collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 5, 6, 7, 8, 9, 40]);
    }

    #[test]
    fn retain_and_rebuild() {
        let mut chains = Chains::with_buckets(5);
        for v in 0..20 {
            insert(&mut chains, v);
        }

        let mut dropped = Vec::new();
        chains.retain(|v| *v % 2 == 0, |v| dropped.push(v));
        dropped.sort_unstable();
        assert_eq!(dropped, (0..20).filter(|v| v % 2 == 1).collect::<Vec<_>>());
        assert_eq!(chains.len(), 10);
        assert_eq!(chains.count_reachable(), 10);

        let mut dropped = Vec::new();
        chains.rebuild(11, |v| *v, |v| *v < 10, |v| dropped.push(v));
        dropped.sort_unstable();
        assert_eq!(dropped, vec![10, 12, 14, 16, 18]);
        assert_eq!(chains.bucket_count(), 11);
        assert_eq!(chains.len(), 5);
        assert_eq!(chains.count_reachable(), 5);
        for v in [0, 2, 4, 6, 8] {
            let bucket = chains.bucket_index(v);
            assert!(chains.find(bucket, |x| *x == v).is_some());
        }

        let items = chains.into_items();
        assert_eq!(items.len(), 5);
    }
}
