//! Publish path and snapshot-then-live attach.

use crate::clock::EpochClock;
use crate::error::Result;
use crate::mailbox::OfferOutcome;
use crate::store::LastValueStore;
use crate::subscriptions::{DetachReason, Subscription, SubscriptionRegistry};
use crate::types::{Key, KeyFilter, SharedRecord, SubscriberId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Result of [`Broadcaster::attach`]: the reconciled initial image and the
/// live subscription.
#[derive(Debug)]
pub struct Attachment {
    /// Records current at attach time, ordered by key, minus any entry a
    /// newer live update already superseded.
    pub snapshot: Vec<SharedRecord>,
    pub subscription: Arc<Subscription>,
}

impl Attachment {
    pub fn id(&self) -> SubscriberId {
        self.subscription.id()
    }
}

/// Counters for the publish path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastStats {
    /// Updates accepted by the store.
    pub published: u64,
    /// Records placed into a mailbox.
    pub offered: u64,
    /// Pending records replaced before delivery.
    pub conflated: u64,
    /// Offers rejected because a newer version was already accepted.
    pub stale: u64,
    pub active_subscribers: usize,
    pub known_keys: usize,
}

/// Moves accepted updates from producers into subscriber mailboxes.
///
/// `publish` never blocks on a consumer: the only per-subscriber work is a
/// mailbox offer.
pub struct Broadcaster {
    store: LastValueStore,
    registry: Arc<SubscriptionRegistry>,
    published: AtomicU64,
    offered: AtomicU64,
    conflated: AtomicU64,
    stale: AtomicU64,
}

impl Broadcaster {
    pub fn new(clock: Arc<dyn EpochClock>) -> Self {
        Self::with_parts(LastValueStore::new(clock), Arc::new(SubscriptionRegistry::new()))
    }

    pub fn with_parts(store: LastValueStore, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            store,
            registry,
            published: AtomicU64::new(0),
            offered: AtomicU64::new(0),
            conflated: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &LastValueStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Apply an update to the store and offer it to every interested
    /// subscriber.
    pub fn publish(
        &self,
        key: impl Into<Key>,
        payload: Vec<u8>,
        claimed_at: Timestamp,
    ) -> Result<SharedRecord> {
        let record = self.store.apply(key.into(), payload, claimed_at)?;
        self.published.fetch_add(1, Ordering::Relaxed);
        self.fanout(&record);
        Ok(record)
    }

    fn fanout(&self, record: &SharedRecord) {
        for sub in self.registry.subscribers_for(record.key.as_str()) {
            match sub.offer(record) {
                Some(OfferOutcome::Accepted) => {
                    self.offered.fetch_add(1, Ordering::Relaxed);
                }
                Some(OfferOutcome::Replaced) => {
                    self.offered.fetch_add(1, Ordering::Relaxed);
                    self.conflated.fetch_add(1, Ordering::Relaxed);
                }
                Some(OfferOutcome::Stale) => {
                    self.stale.fetch_add(1, Ordering::Relaxed);
                }
                None => {}
            }
        }
    }

    /// Register a subscriber and build its initial image.
    ///
    /// Registration happens strictly before the snapshot is read, so any
    /// update the snapshot misses is fanned out to the new mailboxes. Each
    /// snapshot entry is then reconciled by version with its mailbox: a newer
    /// pending live record wins, and a pending record not newer than the
    /// snapshot is dropped as a duplicate.
    pub fn attach(&self, id: SubscriberId, filter: KeyFilter) -> Result<Attachment> {
        let known_keys = match filter {
            KeyFilter::All => self.store.keys(),
            KeyFilter::Keys(_) => Vec::new(),
        };
        let subscription = self.registry.subscribe(id, filter, known_keys)?;

        let snapshot: Vec<SharedRecord> = self
            .store
            .snapshot(subscription.filter())
            .into_iter()
            .filter(|record| subscription.reconcile(record))
            .collect();

        debug!(
            subscriber = %id,
            snapshot_len = snapshot.len(),
            "subscriber attached"
        );
        Ok(Attachment {
            snapshot,
            subscription,
        })
    }

    /// Detach a subscriber. No data reaches its sink once this returns.
    pub fn detach(&self, id: SubscriberId) -> Result<()> {
        self.detach_with(id, DetachReason::Unsubscribed)
    }

    pub fn detach_with(&self, id: SubscriberId, reason: DetachReason) -> Result<()> {
        self.registry.unsubscribe(id, reason).map(|_| ())
    }

    pub fn get(&self, key: &str) -> Option<SharedRecord> {
        self.store.get(key)
    }

    pub fn snapshot(&self, filter: &KeyFilter) -> Vec<SharedRecord> {
        self.store.snapshot(filter)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.published.load(Ordering::Relaxed),
            offered: self.offered.load(Ordering::Relaxed),
            conflated: self.conflated.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            active_subscribers: self.registry.len(),
            known_keys: self.store.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::LastPriceError;
    use crate::types::Version;

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(Arc::new(ManualClock::new(Timestamp(0))))
    }

    #[test]
    fn test_publish_offers_to_matching_subscribers() {
        let b = broadcaster();
        let air = b.attach(SubscriberId(1), KeyFilter::keys(["AIR"])).unwrap();
        let all = b.attach(SubscriberId(2), KeyFilter::All).unwrap();

        b.publish("AIR", b"10".to_vec(), Timestamp(0)).unwrap();
        b.publish("VOW", b"20".to_vec(), Timestamp(0)).unwrap();

        assert_eq!(air.subscription.pending_count(), 1);
        assert_eq!(all.subscription.pending_count(), 2);
        assert_eq!(b.stats().offered, 3);
    }

    #[test]
    fn test_slow_subscriber_holds_one_record_per_key() {
        let b = broadcaster();
        let slow = b.attach(SubscriberId(1), KeyFilter::All).unwrap();

        for i in 0..1_000u32 {
            b.publish("AIR", i.to_le_bytes().to_vec(), Timestamp(0)).unwrap();
        }

        let sub = &slow.subscription;
        assert_eq!(sub.mailbox_count(), 1);
        let latest = sub.mailbox("AIR").unwrap().drain().unwrap();
        assert_eq!(latest.version, Version(1_000));
        assert_eq!(b.stats().conflated, 999);
    }

    #[test]
    fn test_attach_snapshot_contains_current_values() {
        let b = broadcaster();
        b.publish("AIR", b"1".to_vec(), Timestamp(0)).unwrap();
        b.publish("AIR", b"2".to_vec(), Timestamp(0)).unwrap();
        b.publish("NEE", b"3".to_vec(), Timestamp(0)).unwrap();

        let attachment = b.attach(SubscriberId(1), KeyFilter::All).unwrap();
        let versions: Vec<_> = attachment
            .snapshot
            .iter()
            .map(|r| (r.key.to_string(), r.version))
            .collect();
        assert_eq!(
            versions,
            vec![("AIR".to_string(), Version(2)), ("NEE".to_string(), Version(1))]
        );
        // Snapshot values are not also pending live.
        assert_eq!(attachment.subscription.pending_count(), 0);
    }

    #[test]
    fn test_attach_duplicate_id() {
        let b = broadcaster();
        b.attach(SubscriberId(1), KeyFilter::All).unwrap();
        let result = b.attach(SubscriberId(1), KeyFilter::All);
        assert!(matches!(result, Err(LastPriceError::SubscriberExists(_))));
    }

    #[test]
    fn test_publish_after_detach_is_noop_for_subscriber() {
        let b = broadcaster();
        let attachment = b.attach(SubscriberId(1), KeyFilter::All).unwrap();
        b.detach(SubscriberId(1)).unwrap();

        b.publish("AIR", vec![], Timestamp(0)).unwrap();
        assert_eq!(attachment.subscription.mailbox_count(), 0);
        assert_eq!(b.stats().offered, 0);
    }
}
