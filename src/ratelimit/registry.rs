//! Recency-ordered map of live buckets.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use super::id::BucketId;

struct Slot<V> {
    value: V,
    stamp: u64,
}

/// A map from identity to value with optional least-recently-used eviction.
///
/// Every lookup or insert stamps the entry with a monotonically increasing
/// counter; `recency` orders identities by that stamp so the oldest one can
/// be found without scanning.
pub(crate) struct Registry<V> {
    entries: HashMap<BucketId, Slot<V>>,
    recency: BTreeMap<u64, BucketId>,
    clock: u64,
    capacity: Option<NonZeroUsize>,
}

impl<V: Clone> Registry<V> {
    pub(crate) fn new(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
            capacity,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up `id`, marking it as most recently used.
    pub(crate) fn get(&mut self, id: &BucketId) -> Option<V> {
        let stamp = self.tick();
        let slot = self.entries.get_mut(id)?;
        self.recency.remove(&slot.stamp);
        slot.stamp = stamp;
        self.recency.insert(stamp, id.clone());
        Some(slot.value.clone())
    }

    /// Insert or replace `id`. Returns the values evicted to stay within
    /// capacity (never the one just inserted).
    pub(crate) fn insert(&mut self, id: BucketId, value: V) -> Vec<V> {
        let stamp = self.tick();
        if let Some(old) = self.entries.insert(id.clone(), Slot { value, stamp }) {
            self.recency.remove(&old.stamp);
        }
        self.recency.insert(stamp, id);

        let mut evicted = Vec::new();
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity.get() {
                let Some((_, oldest)) = self.recency.pop_first() else {
                    break;
                };
                if let Some(slot) = self.entries.remove(&oldest) {
                    evicted.push(slot.value);
                }
            }
        }
        evicted
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry, returning the values.
    pub(crate) fn drain(&mut self) -> Vec<V> {
        self.recency.clear();
        self.entries.drain().map(|(_, slot)| slot.value).collect()
    }
}
