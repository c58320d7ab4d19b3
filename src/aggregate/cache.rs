use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::key::TrafficKey;

/// Accumulated bits for the currently open window.
///
/// Owned by exactly one task; `accumulate` takes `&mut self` and there is
/// no interior locking. `drain` hands the whole window out by value and
/// starts the next generation empty.
#[derive(Debug)]
pub struct AggregationCache {
    generation: u64,
    start: DateTime<Utc>,
    buckets: HashMap<TrafficKey, u64>,
}

/// A closed window, frozen and ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedWindow {
    /// Monotonic window counter, starting at 0.
    pub generation: u64,
    /// When the window opened.
    pub start: DateTime<Utc>,
    /// When the window was drained. Rows are stamped with this time.
    pub closed_at: DateTime<Utc>,
    /// Accumulated bits per key.
    pub buckets: HashMap<TrafficKey, u64>,
}

impl CompletedWindow {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Sum of all buckets.
    pub fn total_bits(&self) -> u64 {
        self.buckets
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }
}

impl AggregationCache {
    /// Opens generation 0 at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            generation: 0,
            start,
            buckets: HashMap::with_capacity(64),
        }
    }

    /// Adds `amount` to the bucket for `key`, creating it if absent.
    pub fn accumulate(&mut self, key: TrafficKey, amount: u64) {
        let bucket = self.buckets.entry(key).or_insert(0);
        *bucket = bucket.saturating_add(amount);
    }

    /// Current value of a bucket in the open window.
    pub fn get(&self, key: &TrafficKey) -> Option<u64> {
        self.buckets.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Closes the open window at `closed_at` and opens the next one.
    ///
    /// The next window reuses the previous bucket count as its capacity
    /// hint so steady-state traffic does not rehash on every window.
    pub fn drain(&mut self, closed_at: DateTime<Utc>) -> CompletedWindow {
        let capacity = self.buckets.len().max(64);
        let buckets = std::mem::replace(&mut self.buckets, HashMap::with_capacity(capacity));
        let generation = self.generation;
        let start = self.start;

        self.generation += 1;
        self.start = closed_at;

        CompletedWindow {
            generation,
            start,
            closed_at,
            buckets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Interface;
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid ts")
    }

    fn key(remote_asn: u32, ingress: bool) -> TrafficKey {
        TrafficKey {
            iface: Arc::new(Interface {
                name: "eth0".to_string(),
                host: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                id: 1,
                sample: 100,
            }),
            remote_asn,
            local_asn: 65002,
            ingress,
        }
    }

    #[test]
    fn test_accumulate_creates_and_adds() {
        let mut cache = AggregationCache::new(ts(0));
        cache.accumulate(key(65001, true), 800_000);
        cache.accumulate(key(65001, true), 200_000);
        cache.accumulate(key(65001, false), 1);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key(65001, true)), Some(1_000_000));
        assert_eq!(cache.get(&key(65001, false)), Some(1));
        assert_eq!(cache.get(&key(1, true)), None);
    }

    #[test]
    fn test_accumulate_saturates() {
        let mut cache = AggregationCache::new(ts(0));
        cache.accumulate(key(1, true), u64::MAX - 1);
        cache.accumulate(key(1, true), 10);
        assert_eq!(cache.get(&key(1, true)), Some(u64::MAX));
    }

    #[test]
    fn test_drain_moves_contents_and_resets() {
        let mut cache = AggregationCache::new(ts(0));
        cache.accumulate(key(65001, true), 800_000);

        let window = cache.drain(ts(60));
        assert_eq!(window.generation, 0);
        assert_eq!(window.start, ts(0));
        assert_eq!(window.closed_at, ts(60));
        assert_eq!(window.len(), 1);
        assert_eq!(window.total_bits(), 800_000);

        assert!(cache.is_empty());
        assert_eq!(cache.generation(), 1);
        assert_eq!(cache.start(), ts(60));
    }

    #[test]
    fn test_drained_window_independent_of_next_generation() {
        let mut cache = AggregationCache::new(ts(0));
        cache.accumulate(key(1, true), 5);
        let first = cache.drain(ts(60));

        cache.accumulate(key(1, true), 7);
        let second = cache.drain(ts(120));

        assert_eq!(first.buckets.get(&key(1, true)), Some(&5));
        assert_eq!(second.buckets.get(&key(1, true)), Some(&7));
        assert_eq!(second.generation, 1);
        assert_eq!(second.start, ts(60));
    }

    #[test]
    fn test_drain_empty_cache() {
        let mut cache = AggregationCache::new(ts(0));
        let window = cache.drain(ts(1));
        assert!(window.is_empty());
        assert_eq!(window.total_bits(), 0);
    }
}
