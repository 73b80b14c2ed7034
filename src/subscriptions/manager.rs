//! Registry of active subscriptions.

use crate::error::{LastPriceError, Result};
use crate::types::{Key, KeyFilter, SubscriberId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::{DetachReason, Subscription};

/// Immutable view of the registry. Replaced wholesale on every mutation.
#[derive(Default)]
struct RegistryImage {
    by_id: HashMap<SubscriberId, Arc<Subscription>>,
    /// Explicit-filter subscriptions indexed by key.
    by_key: HashMap<Key, Vec<Arc<Subscription>>>,
    /// `KeyFilter::All` subscriptions.
    wildcard: Vec<Arc<Subscription>>,
}

impl RegistryImage {
    fn with(&self, sub: Arc<Subscription>) -> Self {
        let mut by_id = self.by_id.clone();
        let mut by_key = self.by_key.clone();
        let mut wildcard = self.wildcard.clone();

        match sub.filter() {
            KeyFilter::All => wildcard.push(Arc::clone(&sub)),
            KeyFilter::Keys(keys) => {
                for key in keys {
                    by_key.entry(key.clone()).or_default().push(Arc::clone(&sub));
                }
            }
        }
        by_id.insert(sub.id(), sub);

        Self {
            by_id,
            by_key,
            wildcard,
        }
    }

    fn without(&self, id: SubscriberId) -> Self {
        let mut by_id = self.by_id.clone();
        by_id.remove(&id);

        let by_key = self
            .by_key
            .iter()
            .filter_map(|(key, subs)| {
                let subs: Vec<_> = subs.iter().filter(|s| s.id() != id).cloned().collect();
                (!subs.is_empty()).then(|| (key.clone(), subs))
            })
            .collect();
        let wildcard = self
            .wildcard
            .iter()
            .filter(|s| s.id() != id)
            .cloned()
            .collect();

        Self {
            by_id,
            by_key,
            wildcard,
        }
    }
}

/// Tracks subscribers and resolves fan-out targets.
///
/// Readers clone an `Arc` of the current image under a read lock and work
/// on it lock-free; writers build a new image and swap it in. Fan-out
/// therefore never waits on registration work and never observes a
/// partially registered subscriber.
pub struct SubscriptionRegistry {
    image: RwLock<Arc<RegistryImage>>,
    /// Serializes mutations so concurrent subscribes do not lose each other.
    writer: Mutex<()>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            image: RwLock::new(Arc::new(RegistryImage::default())),
            writer: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh subscriber id.
    pub fn next_subscriber_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a subscriber.
    ///
    /// `known_keys` seeds mailboxes for an `All` filter; explicit filters get a
    /// mailbox per listed key.
    pub fn subscribe<I>(
        &self,
        id: SubscriberId,
        filter: KeyFilter,
        known_keys: I,
    ) -> Result<Arc<Subscription>>
    where
        I: IntoIterator<Item = Key>,
    {
        let _writer = self.writer.lock();
        let current = self.current();
        if current.by_id.contains_key(&id) {
            return Err(LastPriceError::SubscriberExists(id));
        }

        let sub = Arc::new(Subscription::new(id, filter, known_keys));
        let next = current.with(Arc::clone(&sub));
        *self.image.write() = Arc::new(next);

        debug!(subscriber = %id, filter = ?sub.filter(), "subscriber registered");
        Ok(sub)
    }

    /// Remove a subscriber, deactivate it and release its mailboxes.
    pub fn unsubscribe(&self, id: SubscriberId, reason: DetachReason) -> Result<Arc<Subscription>> {
        let sub = {
            let _writer = self.writer.lock();
            let current = self.current();
            let sub = current
                .by_id
                .get(&id)
                .cloned()
                .ok_or(LastPriceError::SubscriberNotFound(id))?;
            *self.image.write() = Arc::new(current.without(id));
            sub
        };

        // Outside the writer lock: deactivation may wait for an in-flight
        // delivery to finish.
        sub.deactivate(reason.clone());
        debug!(subscriber = %id, ?reason, "subscriber removed");
        Ok(sub)
    }

    /// Active subscriptions whose filter matches `key`.
    pub fn subscribers_for(&self, key: &str) -> Vec<Arc<Subscription>> {
        let image = self.current();
        image
            .by_key
            .get(key)
            .into_iter()
            .flatten()
            .chain(image.wildcard.iter())
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: SubscriberId) -> Option<Arc<Subscription>> {
        self.current().by_id.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<_> = self.current().by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.current().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Arc<RegistryImage> {
        Arc::clone(&self.image.read())
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
