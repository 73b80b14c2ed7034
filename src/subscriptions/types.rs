//! Subscription state shared between the broadcaster and a dispatch loop.

use crate::mailbox::{ConflatingMailbox, OfferOutcome};
use crate::types::{Key, KeyFilter, SharedRecord, SubscriberId};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Why a subscription was detached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// Explicitly detached by the consumer or transport.
    Unsubscribed,
    /// The sink reported a failure (disconnect, transport error).
    SinkFailed(String),
    /// The service is shutting down.
    ShutDown,
    /// The dispatch loop observed a broken invariant.
    InvariantViolation(String),
}

/// Wake-up delivered to a dispatch loop.
#[derive(Debug)]
pub(crate) enum Signal {
    /// A mailbox went from empty to non-empty.
    Ready(Arc<ConflatingMailbox>),
    /// The subscription was deactivated.
    Detached,
}

/// One attached consumer: its filter, its mailboxes and its wake channel.
///
/// Each mailbox is enqueued on the wake channel only on its empty → non-empty
/// transition, so the channel never holds more entries than there are
/// pending mailboxes.
pub struct Subscription {
    id: SubscriberId,
    filter: KeyFilter,
    mailboxes: DashMap<Key, Arc<ConflatingMailbox>>,
    active: AtomicBool,
    wake_tx: Sender<Signal>,
    wake_rx: Receiver<Signal>,
    /// Dropped on detach; receivers then observe disconnection.
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    /// Held by the dispatch loop around every hand-off to the sink.
    delivery: ReentrantMutex<()>,
    detach_reason: Mutex<Option<DetachReason>>,
    conflated: AtomicU64,
}

impl Subscription {
    /// Create a subscription, eagerly allocating mailboxes for every key in
    /// an explicit filter, or for every currently known key when the filter
    /// is `All`.
    pub(crate) fn new<I>(id: SubscriberId, filter: KeyFilter, known_keys: I) -> Self
    where
        I: IntoIterator<Item = Key>,
    {
        let mailboxes = DashMap::new();
        match &filter {
            KeyFilter::All => {
                for key in known_keys {
                    mailboxes.insert(key.clone(), Arc::new(ConflatingMailbox::new(key)));
                }
            }
            KeyFilter::Keys(keys) => {
                for key in keys {
                    mailboxes.insert(key.clone(), Arc::new(ConflatingMailbox::new(key.clone())));
                }
            }
        }

        let (wake_tx, wake_rx) = unbounded();
        let (cancel_tx, cancel_rx) = unbounded();

        Self {
            id,
            filter,
            mailboxes,
            active: AtomicBool::new(true),
            wake_tx,
            wake_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
            delivery: ReentrantMutex::new(()),
            detach_reason: Mutex::new(None),
            conflated: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn filter(&self) -> &KeyFilter {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Offer a live record to this subscriber.
    ///
    /// Returns `None` if the subscription is inactive or not interested in
    /// the key.
    pub fn offer(&self, record: &SharedRecord) -> Option<OfferOutcome> {
        if !self.is_active() || !self.filter.matches(record.key.as_str()) {
            return None;
        }

        let mailbox = self.mailbox_or_insert(&record.key);
        let outcome = mailbox.offer(Arc::clone(record));
        if outcome.discarded_prior() {
            self.conflated.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.became_ready() {
            // Cannot fail: this subscription owns a receiver.
            let _ = self.wake_tx.send(Signal::Ready(mailbox));
        }

        // A detach may have cleared the mailboxes while this offer was
        // creating one; release it again.
        if !self.is_active() {
            self.mailboxes.clear();
        }

        Some(outcome)
    }

    /// Reconcile a snapshot entry against the live mailbox for its key.
    /// See [`ConflatingMailbox::reconcile`].
    pub fn reconcile(&self, snapshot: &SharedRecord) -> bool {
        if !self.is_active() {
            return false;
        }
        let delivered = self.mailbox_or_insert(&snapshot.key).reconcile(snapshot);
        // Same race as in `offer`: drop a mailbox created after a detach.
        if !self.is_active() {
            self.mailboxes.clear();
            return false;
        }
        delivered
    }

    pub fn mailbox(&self, key: &str) -> Option<Arc<ConflatingMailbox>> {
        self.mailboxes.get(key).map(|m| Arc::clone(m.value()))
    }

    /// Number of allocated mailboxes.
    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Number of mailboxes holding an undelivered record.
    pub fn pending_count(&self) -> usize {
        self.mailboxes.iter().filter(|m| m.value().has_pending()).count()
    }

    /// Total undelivered records discarded by conflation.
    pub fn conflated(&self) -> u64 {
        self.conflated.load(Ordering::Relaxed)
    }

    pub fn detach_reason(&self) -> Option<DetachReason> {
        self.detach_reason.lock().clone()
    }

    /// Channel that becomes disconnected once the subscription is detached.
    /// Sinks that may block select on it to abandon a delivery.
    pub fn cancelled(&self) -> &Receiver<()> {
        &self.cancel_rx
    }

    /// Deactivate, wait out any in-flight delivery, release mailboxes and wake
    /// the dispatch loop. Returns `false` if already inactive.
    pub(crate) fn deactivate(&self, reason: DetachReason) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.detach_reason.lock() = Some(reason);
        self.cancel_tx.lock().take();

        // Re-entrant, so a sink detaching from inside a delivery does not
        // deadlock on its own dispatch thread.
        let _delivery = self.delivery.lock();
        self.mailboxes.clear();
        self.wake_rx.try_iter().for_each(drop);
        let _ = self.wake_tx.send(Signal::Detached);
        true
    }

    pub(crate) fn delivery_guard(&self) -> ReentrantMutexGuard<'_, ()> {
        self.delivery.lock()
    }

    pub(crate) fn recv_signal(&self) -> Signal {
        // This subscription owns a sender, so the channel never disconnects.
        self.wake_rx.recv().unwrap_or(Signal::Detached)
    }

    pub(crate) fn try_recv_signal(&self) -> Option<Signal> {
        match self.wake_rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Signal::Detached),
        }
    }

    fn mailbox_or_insert(&self, key: &Key) -> Arc<ConflatingMailbox> {
        if let Some(mailbox) = self.mailboxes.get(key.as_str()) {
            return Arc::clone(mailbox.value());
        }
        let entry = self
            .mailboxes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ConflatingMailbox::new(key.clone())));
        Arc::clone(entry.value())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("active", &self.is_active())
            .field("mailboxes", &self.mailbox_count())
            .finish()
    }
}
