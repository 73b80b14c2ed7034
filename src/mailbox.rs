//! Single-slot conflating mailbox.
//!
//! One mailbox exists per (subscriber, key). It holds at most one pending
//! record; a newer offer replaces the pending one, and the replaced value is
//! never delivered. The slot also remembers the highest version it has ever
//! accepted so late offers from racing producers cannot move it backwards.

use crate::types::{Key, SharedRecord, Version};
use parking_lot::Mutex;

/// Result of [`ConflatingMailbox::offer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Slot was empty; the record is now pending.
    Accepted,
    /// A pending record was discarded in favour of this one.
    Replaced,
    /// The record is not newer than what the mailbox already accepted.
    Stale,
}

impl OfferOutcome {
    /// True if the record is now the pending value.
    pub fn is_pending(self) -> bool {
        !matches!(self, OfferOutcome::Stale)
    }

    /// True if this offer moved the slot from empty to non-empty.
    pub fn became_ready(self) -> bool {
        matches!(self, OfferOutcome::Accepted)
    }

    /// True if an undelivered record was dropped.
    pub fn discarded_prior(self) -> bool {
        matches!(self, OfferOutcome::Replaced)
    }
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<SharedRecord>,
    high_water: Version,
}

/// Overwrite-on-offer cell for one key.
///
/// The lock only guards a pointer swap and a version compare; it is never
/// held while a consumer does work, so producers do not wait on consumers.
#[derive(Debug)]
pub struct ConflatingMailbox {
    key: Key,
    slot: Mutex<Slot>,
}

impl ConflatingMailbox {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Make `record` the pending value unless something at least as new was
    /// already accepted.
    pub fn offer(&self, record: SharedRecord) -> OfferOutcome {
        let mut slot = self.slot.lock();
        if record.version <= slot.high_water {
            return OfferOutcome::Stale;
        }
        slot.high_water = record.version;
        match slot.pending.replace(record) {
            Some(_) => OfferOutcome::Replaced,
            None => OfferOutcome::Accepted,
        }
    }

    /// Take the pending record, leaving the slot empty.
    pub fn drain(&self) -> Option<SharedRecord> {
        self.slot.lock().pending.take()
    }

    /// Reconcile a snapshot entry taken after this mailbox started receiving
    /// live offers.
    ///
    /// Returns `false` when a strictly newer live record has already been
    /// accepted; the snapshot entry must then be discarded. Otherwise the
    /// snapshot becomes the high-water mark, any pending record not newer than
    /// it is dropped as a duplicate, and `true` is returned.
    pub fn reconcile(&self, snapshot: &SharedRecord) -> bool {
        let mut slot = self.slot.lock();
        if slot.high_water > snapshot.version {
            return false;
        }
        slot.high_water = snapshot.version;
        slot.pending = None;
        true
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    /// Highest version ever accepted (or reconciled) by this mailbox.
    pub fn high_water(&self) -> Version {
        self.slot.lock().high_water
    }
}
