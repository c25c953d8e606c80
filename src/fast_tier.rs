use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::entry::CacheEntry;

pub(crate) enum Lookup {
    Hit(Value),
    Expired,
    Miss,
}

// Bounded in-memory tier. Eviction is FIFO by insertion sequence, reads never reorder anything. A replaced key gets
// a new sequence number, i.e. it counts as freshly inserted.
#[derive(Debug)]
pub(crate) struct FastTier {
    capacity: usize,
    next_seq: u64,
    entries:  HashMap<String, (u64, CacheEntry)>,
    order:    BTreeMap<u64, String>,
}

impl FastTier {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            entries:  HashMap::new(),
            order:    BTreeMap::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Expired entries are dropped on the spot.
    pub(crate) fn get(&mut self, key: &str) -> Lookup {
        let valid = match self.entries.get(key) {
            Some((_, entry)) => entry.is_valid(),
            None => return Lookup::Miss,
        };

        if valid {
            self.entries
                .get(key)
                .map_or(Lookup::Miss, |(_, entry)| Lookup::Hit(entry.value().clone()))
        }
        else {
            self.remove(key);
            Lookup::Expired
        }
    }

    /// Returns the keys evicted to make room.
    pub(crate) fn insert(&mut self, key: String, value: Value, ttl: Duration) -> Vec<String> {
        let mut evicted = Vec::new();

        if !self.remove(&key) {
            while self.entries.len() >= self.capacity {
                let Some((_, oldest)) = self.order.pop_first()
                else {
                    break;
                };
                self.entries.remove(&oldest);
                evicted.push(oldest);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key.clone(), (seq, CacheEntry::new(key, value, ttl)));

        evicted
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        if let Some((seq, _)) = self.entries.remove(key) {
            self.order.remove(&seq);
            true
        }
        else {
            false
        }
    }

    pub(crate) fn remove_prefix(&mut self, prefix: &str) -> usize {
        let keys = self
            .order
            .values()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect::<Vec<_>>();
        keys.iter().filter(|k| self.remove(k)).count()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Walks entries oldest first and drops every expired one. Entries carry individual TTLs so the walk can't stop
    /// at the first valid entry.
    pub(crate) fn sweep_expired(&mut self) -> Vec<String> {
        let expired = self
            .order
            .values()
            .filter(|k| self.entries.get(*k).is_some_and(|(_, e)| !e.is_valid()))
            .cloned()
            .collect::<Vec<_>>();
        for key in &expired {
            self.remove(key);
        }
        expired
    }

    /// Keys from the oldest to the newest.
    pub(crate) fn keys(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn evicts_oldest_inserted_not_least_recently_used() {
        let mut tier = FastTier::new(3);
        tier.insert("a".into(), json!(1), TTL);
        tier.insert("b".into(), json!(2), TTL);
        tier.insert("c".into(), json!(3), TTL);

        // Reading "a" would save it under LRU. It must not here.
        assert!(matches!(tier.get("a"), Lookup::Hit(_)));

        let evicted = tier.insert("d".into(), json!(4), TTL);
        assert_eq!(evicted, vec!["a".to_string()]);
        assert_eq!(tier.keys(), vec!["b", "c", "d"]);
        assert!(matches!(tier.get("a"), Lookup::Miss));
    }

    #[test]
    fn replacing_a_key_does_not_evict_and_moves_it_to_the_back() {
        let mut tier = FastTier::new(2);
        tier.insert("a".into(), json!(1), TTL);
        tier.insert("b".into(), json!(2), TTL);

        let evicted = tier.insert("a".into(), json!(10), TTL);
        assert!(evicted.is_empty());
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.keys(), vec!["b", "a"]);

        let evicted = tier.insert("c".into(), json!(3), TTL);
        assert_eq!(evicted, vec!["b".to_string()]);
        match tier.get("a") {
            Lookup::Hit(v) => assert_eq!(v, json!(10)),
            _ => panic!("'a' must survive"),
        }
    }

    #[test]
    fn zero_capacity_still_holds_one_entry() {
        let mut tier = FastTier::new(0);
        assert_eq!(tier.capacity(), 1);
        tier.insert("a".into(), json!(1), TTL);
        tier.insert("b".into(), json!(2), TTL);
        assert_eq!(tier.keys(), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_over_long_lived_entries() {
        let mut tier = FastTier::new(10);
        tier.insert("long".into(), json!(1), Duration::from_secs(100));
        tier.insert("short1".into(), json!(2), Duration::from_secs(1));
        tier.insert("short2".into(), json!(3), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(tier.sweep_expired(), vec!["short1", "short2"]);
        assert_eq!(tier.keys(), vec!["long"]);
    }

    #[test]
    fn remove_prefix_only_touches_the_family() {
        let mut tier = FastTier::new(10);
        for key in ["items", "items:1", "items:2", "orders:1"] {
            tier.insert(key.into(), json!(null), TTL);
        }
        assert_eq!(tier.remove_prefix("items:"), 2);
        assert_eq!(tier.keys(), vec!["items", "orders:1"]);
    }
}
