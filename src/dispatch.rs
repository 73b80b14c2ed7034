//! Per-subscriber delivery loop and the egress sink seam.
//!
//! A dispatch loop first hands the attachment snapshot to its sink, then
//! blocks on the subscription's wake channel. Every empty → non-empty
//! mailbox transition enqueues that mailbox, so the loop wakes as soon as
//! there is something to deliver and sleeps otherwise.

use crate::broadcaster::Attachment;
use crate::clock::EpochClock;
use crate::error::{LastPriceError, Result, SinkError};
use crate::mailbox::ConflatingMailbox;
use crate::subscriptions::{DetachReason, Signal, Subscription, SubscriptionRegistry};
use crate::telemetry::LatencyRecorder;
use crate::types::{Key, SharedRecord, SubscriberId, Update, UpdateOrigin, Version};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Where a dispatch loop hands updates. Transports implement this.
pub trait UpdateSink: Send {
    /// Hand one update to the consumer.
    ///
    /// `cancelled` disconnects when the subscriber is detached; a sink that
    /// may block must select on it and return [`SinkError::Cancelled`].
    fn deliver(&mut self, update: Update, cancelled: &Receiver<()>) -> std::result::Result<(), SinkError>;

    /// Called once when the loop stops.
    fn closed(&mut self, _reason: &DetachReason) {}
}

impl<F> UpdateSink for F
where
    F: FnMut(Update) -> std::result::Result<(), SinkError> + Send,
{
    fn deliver(&mut self, update: Update, _cancelled: &Receiver<()>) -> std::result::Result<(), SinkError> {
        self(update)
    }
}

/// Sink backed by a bounded crossbeam channel.
///
/// When the consumer falls behind, `deliver` blocks the dispatch loop (never
/// a producer) and conflation absorbs the backlog in the mailboxes.
pub struct ChannelSink {
    tx: Sender<Update>,
}

/// Create a channel sink and the receiver a consumer reads from.
pub fn channel_sink(capacity: usize) -> (ChannelSink, Receiver<Update>) {
    let (tx, rx) = bounded(capacity);
    (ChannelSink { tx }, rx)
}

impl UpdateSink for ChannelSink {
    fn deliver(&mut self, update: Update, cancelled: &Receiver<()>) -> std::result::Result<(), SinkError> {
        select! {
            send(self.tx, update) -> res => res.map_err(|_| SinkError::Disconnected),
            recv(cancelled) -> _ => Err(SinkError::Cancelled),
        }
    }
}

/// Whether a dispatch loop can make more progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Nothing pending; the subscription is still active.
    Idle,
    /// The subscription is detached; the loop is done.
    Detached,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Drains one subscription's mailboxes into a sink.
pub struct DispatchLoop<S: UpdateSink> {
    subscription: Arc<Subscription>,
    registry: Arc<SubscriptionRegistry>,
    sink: S,
    snapshot: VecDeque<SharedRecord>,
    last_delivered: HashMap<Key, Version>,
    clock: Arc<dyn EpochClock>,
    latency: Arc<dyn LatencyRecorder>,
    delivered: u64,
}

impl<S: UpdateSink> DispatchLoop<S> {
    pub fn new(
        attachment: Attachment,
        registry: Arc<SubscriptionRegistry>,
        sink: S,
        clock: Arc<dyn EpochClock>,
        latency: Arc<dyn LatencyRecorder>,
    ) -> Self {
        Self {
            subscription: attachment.subscription,
            registry,
            sink,
            snapshot: attachment.snapshot.into(),
            last_delivered: HashMap::new(),
            clock,
            latency,
            delivered: 0,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.subscription.id()
    }

    /// Updates handed to the sink so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Deliver everything currently pending without blocking.
    pub fn run_until_idle(&mut self) -> Result<LoopState> {
        if self.deliver_snapshot()? == Flow::Stop {
            return Ok(LoopState::Detached);
        }
        while let Some(signal) = self.subscription.try_recv_signal() {
            let flow = match signal {
                Signal::Ready(mailbox) => self.drain_mailbox(&mailbox)?,
                Signal::Detached => Flow::Stop,
            };
            if flow == Flow::Stop {
                return Ok(LoopState::Detached);
            }
        }
        if self.subscription.is_active() {
            Ok(LoopState::Idle)
        } else {
            Ok(LoopState::Detached)
        }
    }

    /// Deliver until the subscription is detached, sleeping while idle.
    /// Returns the number of updates delivered.
    pub fn run(mut self) -> Result<u64> {
        let outcome = self.run_blocking();
        let reason = self
            .subscription
            .detach_reason()
            .unwrap_or(DetachReason::Unsubscribed);
        self.sink.closed(&reason);
        debug!(
            subscriber = %self.id(),
            delivered = self.delivered,
            ?reason,
            "dispatch loop stopped"
        );
        outcome.map(|()| self.delivered)
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<DispatchHandle>
    where
        S: 'static,
    {
        let id = self.id();
        let join = thread::Builder::new()
            .name(format!("dispatch-{}", id))
            .spawn(move || self.run())?;
        Ok(DispatchHandle { id, join })
    }

    fn run_blocking(&mut self) -> Result<()> {
        if self.deliver_snapshot()? == Flow::Stop {
            return Ok(());
        }
        loop {
            let flow = match self.subscription.recv_signal() {
                Signal::Ready(mailbox) => self.drain_mailbox(&mailbox)?,
                Signal::Detached => Flow::Stop,
            };
            if flow == Flow::Stop {
                return Ok(());
            }
        }
    }

    fn deliver_snapshot(&mut self) -> Result<Flow> {
        while let Some(record) = self.snapshot.pop_front() {
            if self.deliver(record, UpdateOrigin::Snapshot)? == Flow::Stop {
                self.snapshot.clear();
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn drain_mailbox(&mut self, mailbox: &ConflatingMailbox) -> Result<Flow> {
        match mailbox.drain() {
            Some(record) => self.deliver(record, UpdateOrigin::Live),
            None => Ok(Flow::Continue),
        }
    }

    fn deliver(&mut self, record: SharedRecord, origin: UpdateOrigin) -> Result<Flow> {
        let subscription = Arc::clone(&self.subscription);
        let id = subscription.id();
        let guard = subscription.delivery_guard();
        if !subscription.is_active() {
            return Ok(Flow::Stop);
        }

        if let Some(previous) = self.last_delivered.get(record.key.as_str()) {
            if record.version <= *previous {
                error!(
                    subscriber = %id,
                    key = %record.key,
                    version = %record.version,
                    previous = %previous,
                    "version regression at delivery"
                );
                let detail = format!(
                    "key {} delivered {} after {}",
                    record.key, record.version, previous
                );
                drop(guard);
                let _ = self
                    .registry
                    .unsubscribe(id, DetachReason::InvariantViolation(detail.clone()));
                return Err(LastPriceError::InvariantViolation(detail));
            }
        }

        let latency_ns = self.clock.now().nanos_since(record.observed_at);
        let key = record.key.clone();
        let version = record.version;
        match self.sink.deliver(Update { record, origin }, subscription.cancelled()) {
            Ok(()) => {
                self.latency.record(id, latency_ns);
                self.last_delivered.insert(key, version);
                self.delivered += 1;
                Ok(Flow::Continue)
            }
            Err(SinkError::Cancelled) => Ok(Flow::Stop),
            Err(e) => {
                warn!(subscriber = %id, error = %e, "sink failed, detaching");
                drop(guard);
                // Already gone if a concurrent detach won the race.
                let _ = self
                    .registry
                    .unsubscribe(id, DetachReason::SinkFailed(e.to_string()));
                Ok(Flow::Stop)
            }
        }
    }
}

/// Handle to a dispatch loop running on its own thread.
#[derive(Debug)]
pub struct DispatchHandle {
    id: SubscriberId,
    join: JoinHandle<Result<u64>>,
}

impl DispatchHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to stop. Returns the number of updates delivered.
    pub fn join(self) -> Result<u64> {
        self.join.join().map_err(|_| {
            LastPriceError::InvariantViolation(format!("dispatch thread {} panicked", self.id))
        })?
    }
}
