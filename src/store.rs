//! Last-value store: the authoritative key → current record mapping.

use crate::clock::EpochClock;
use crate::error::{LastPriceError, Result};
use crate::types::{Key, KeyFilter, SharedRecord, Timestamp, ValueRecord, Version};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::error;

/// Concurrent mapping from key to its most recent record.
///
/// The map entry for a key is the unit of synchronization: applies to the
/// same key are serialized by that entry, applies to other keys only share
/// a map shard for the duration of the insert.
///
/// Entries are created on first update and never removed.
pub struct LastValueStore {
    records: DashMap<Key, SharedRecord>,
    clock: Arc<dyn EpochClock>,
}

impl LastValueStore {
    pub fn new(clock: Arc<dyn EpochClock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Store a new value for `key` and return the record built for it.
    ///
    /// The version is the previous version plus one (1 for a new key) and the
    /// ingestion timestamp is read while the entry is held, so both are
    /// ordered by arrival at the store rather than by `claimed_at`.
    pub fn apply(&self, key: Key, payload: Vec<u8>, claimed_at: Timestamp) -> Result<SharedRecord> {
        match self.records.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().version;
                let version = current.next().ok_or_else(|| {
                    error!(key = %entry.key(), version = %current, "version space exhausted");
                    LastPriceError::InvariantViolation(format!(
                        "version overflow for key {}",
                        entry.key()
                    ))
                })?;
                let record = Arc::new(ValueRecord {
                    key: entry.key().clone(),
                    payload,
                    version,
                    observed_at: self.clock.now(),
                    claimed_at,
                });
                entry.insert(Arc::clone(&record));
                Ok(record)
            }
            Entry::Vacant(entry) => {
                let record = Arc::new(ValueRecord {
                    key: entry.key().clone(),
                    payload,
                    version: Version(1),
                    observed_at: self.clock.now(),
                    claimed_at,
                });
                entry.insert(Arc::clone(&record));
                Ok(record)
            }
        }
    }

    /// Current record for `key`, if it was ever updated.
    pub fn get(&self, key: &str) -> Option<SharedRecord> {
        self.records.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Current records of every key matching `filter`, ordered by key.
    ///
    /// Each record was current at some instant during the call. No
    /// cross-key atomicity is provided.
    pub fn snapshot(&self, filter: &KeyFilter) -> Vec<SharedRecord> {
        let mut records: Vec<SharedRecord> = match filter {
            KeyFilter::All => self
                .records
                .iter()
                .map(|r| Arc::clone(r.value()))
                .collect(),
            KeyFilter::Keys(keys) => keys.iter().filter_map(|k| self.get(k.as_str())).collect(),
        };
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Every key that has been updated at least once.
    pub fn keys(&self) -> Vec<Key> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    fn test_store() -> (LastValueStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
        (LastValueStore::new(clock.clone()), clock)
    }

    #[test]
    fn test_versions_start_at_one() {
        let (store, _) = test_store();

        let first = store.apply(Key::new("AAPL"), b"150.00".to_vec(), Timestamp(7)).unwrap();
        let second = store.apply(Key::new("AAPL"), b"150.25".to_vec(), Timestamp(3)).unwrap();

        assert_eq!(first.version, Version(1));
        assert_eq!(second.version, Version(2));
        // Producer timestamps do not influence ordering.
        assert_eq!(second.claimed_at, Timestamp(3));
        assert_eq!(store.get("AAPL").unwrap().payload, b"150.25");
    }

    #[test]
    fn test_observed_at_comes_from_store_clock() {
        let (store, clock) = test_store();
        clock.set(Timestamp(42));

        let record = store.apply(Key::new("VOW"), vec![1], Timestamp(999_999)).unwrap();
        assert_eq!(record.observed_at, Timestamp(42));
    }

    #[test]
    fn test_unknown_key_is_absent() {
        let (store, _) = test_store();
        assert!(store.get("NOPE").is_none());
        assert!(store.snapshot(&KeyFilter::keys(["NOPE"])).is_empty());
    }

    #[test]
    fn test_snapshot_filters_and_orders() {
        let (store, _) = test_store();
        for key in ["TEAM", "AIR", "NEE"] {
            store.apply(Key::new(key), vec![0], Timestamp(0)).unwrap();
        }
        store.apply(Key::new("AIR"), vec![1], Timestamp(0)).unwrap();

        let all = store.snapshot(&KeyFilter::All);
        let keys: Vec<&str> = all.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["AIR", "NEE", "TEAM"]);
        assert_eq!(all[0].version, Version(2));

        let some = store.snapshot(&KeyFilter::keys(["NEE", "SAF"]));
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].key.as_str(), "NEE");
    }

    #[test]
    fn test_concurrent_applies_same_key_are_linearized() {
        let (store, _) = test_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..500)
                        .map(|_| store.apply(Key::new("RDSA"), vec![], Timestamp(0)).unwrap().version.0)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut versions: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        versions.sort_unstable();

        let expected: Vec<u64> = (1..=4000).collect();
        assert_eq!(versions, expected);
        assert_eq!(store.get("RDSA").unwrap().version, Version(4000));
    }
}
