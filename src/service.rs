//! The last-price service: validated ingress, batch runs and managed
//! subscriber dispatch on top of the [`Broadcaster`].

use crate::batches::BatchRunRepository;
use crate::broadcaster::{BroadcastStats, Broadcaster};
use crate::clock::{EpochClock, SystemClock};
use crate::config::ServiceConfig;
use crate::dispatch::{channel_sink, DispatchHandle, DispatchLoop, UpdateSink};
use crate::error::{LastPriceError, Result};
use crate::subscriptions::DetachReason;
use crate::telemetry::{LatencyRecorder, NoopLatencyRecorder};
use crate::types::{
    BatchRunId, Key, KeyFilter, PriceInput, ProducerId, SharedRecord, SubscriberId, Timestamp,
    Update,
};
use crate::validation::IngressValidator;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Service-wide counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub broadcast: BroadcastStats,
    pub active_batch_runs: usize,
}

/// Background thread sweeping abandoned batch runs.
struct Janitor {
    /// Dropped to stop the thread.
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

impl Janitor {
    fn spawn(batches: Arc<BatchRunRepository>, config: &ServiceConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let interval = config.batch_cleanup_interval();
        let timeout = config.abandoned_batch_run_timeout();

        let join = thread::Builder::new()
            .name("batch-janitor".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let removed = batches.remove_outdated(timeout, None);
                            if !removed.is_empty() {
                                debug!(count = removed.len(), "removed abandoned batch runs");
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        Ok(Self { stop_tx, join })
    }

    fn stop(self) {
        drop(self.stop_tx);
        let _ = self.join.join();
    }
}

/// Last-price service.
///
/// Producers publish single prices or upload them in batch runs; consumers
/// query the latest price per instrument or attach a sink that receives a
/// snapshot followed by conflated live updates on its own dispatch thread.
pub struct LastPriceService {
    config: ServiceConfig,
    broadcaster: Arc<Broadcaster>,
    validator: IngressValidator,
    batches: Arc<BatchRunRepository>,
    clock: Arc<dyn EpochClock>,
    latency: Arc<dyn LatencyRecorder>,
    janitor: Mutex<Option<Janitor>>,
    shut_down: AtomicBool,
}

impl LastPriceService {
    /// Start a service on the system clock without latency recording.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Self::with_components(config, Arc::new(SystemClock), Arc::new(NoopLatencyRecorder))
    }

    /// Start a service with an explicit clock and latency recorder.
    pub fn with_components(
        config: ServiceConfig,
        clock: Arc<dyn EpochClock>,
        latency: Arc<dyn LatencyRecorder>,
    ) -> Result<Self> {
        config.validate()?;

        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&clock)));
        let batches = Arc::new(BatchRunRepository::new(Arc::clone(&clock)));
        let janitor = Janitor::spawn(Arc::clone(&batches), &config)?;

        info!(
            supported_instruments = config.supported_instruments.as_ref().map(Vec::len),
            max_active_batch_runs = config.max_active_batch_runs,
            "last-price service started"
        );
        Ok(Self {
            validator: IngressValidator::new(&config),
            config,
            broadcaster,
            batches,
            clock,
            latency,
            janitor: Mutex::new(Some(janitor)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(LastPriceError::ShutDown);
        }
        Ok(())
    }

    // --- Prices ---

    /// Validate and publish a single price.
    pub fn publish(
        &self,
        producer: &ProducerId,
        key: &str,
        payload: Vec<u8>,
        claimed_at: Timestamp,
    ) -> Result<SharedRecord> {
        self.ensure_running()?;
        self.validator.check_publish(producer, key, &payload)?;
        self.broadcaster.publish(Key::new(key), payload, claimed_at)
    }

    /// Latest price for an instrument, `None` if nothing was published yet.
    pub fn find_last_price(&self, key: &str) -> Result<Option<SharedRecord>> {
        self.validator.check_instrument(key)?;
        Ok(self.broadcaster.get(key))
    }

    // --- Subscribers ---

    /// Attach a sink and start its dispatch loop on a dedicated thread.
    pub fn attach<S>(&self, filter: KeyFilter, sink: S) -> Result<DispatchHandle>
    where
        S: UpdateSink + 'static,
    {
        self.ensure_running()?;
        if let KeyFilter::Keys(keys) = &filter {
            for key in keys {
                self.validator.check_instrument(key.as_str())?;
            }
        }

        let registry = Arc::clone(self.broadcaster.registry());
        let id = registry.next_subscriber_id();
        let attachment = self.broadcaster.attach(id, filter)?;
        let dispatch = DispatchLoop::new(
            attachment,
            Arc::clone(&registry),
            sink,
            Arc::clone(&self.clock),
            Arc::clone(&self.latency),
        );
        match dispatch.spawn() {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let _ = registry.unsubscribe(id, DetachReason::SinkFailed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Attach a bounded channel sink of `sink_capacity` and return its
    /// receiving end.
    pub fn attach_channel(&self, filter: KeyFilter) -> Result<(DispatchHandle, Receiver<Update>)> {
        let (sink, rx) = channel_sink(self.config.sink_capacity);
        let handle = self.attach(filter, sink)?;
        Ok((handle, rx))
    }

    pub fn detach(&self, id: SubscriberId) -> Result<()> {
        self.broadcaster.detach(id)
    }

    // --- Batch runs ---

    pub fn start_batch_run(&self, producer: &ProducerId) -> Result<BatchRunId> {
        self.ensure_running()?;
        self.validator.check_producer(producer)?;

        let limit = self.config.max_active_batch_runs;
        if self.batches.len() >= limit {
            warn!(producer = %producer, limit, "batch run rejected, too many active runs");
            return Err(LastPriceError::TooManyActiveBatchRuns(limit));
        }
        let id = self.batches.create();
        debug!(batch = %id, producer = %producer, "batch run started");
        Ok(id)
    }

    /// Stage a chunk of prices. The whole chunk is rejected if any record
    /// fails validation.
    pub fn upload_chunk(
        &self,
        producer: &ProducerId,
        id: BatchRunId,
        records: Vec<PriceInput>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.validator.check_producer(producer)?;
        for record in &records {
            let checked = self
                .validator
                .check_instrument(record.key.as_str())
                .and_then(|()| self.validator.check_payload(&record.payload));
            if let Err(e) = checked {
                warn!(batch = %id, key = %record.key, error = %e, "chunk rejected");
                return Err(e);
            }
        }

        let count = records.len();
        self.batches.update(id, |run| run.update_records(records))?;
        debug!(batch = %id, count, "chunk uploaded");
        Ok(())
    }

    /// Publish every staged price of a run and close it.
    pub fn complete_batch_run(&self, id: BatchRunId) -> Result<Vec<SharedRecord>> {
        self.ensure_running()?;
        let run = self
            .batches
            .remove(id)
            .ok_or(LastPriceError::BatchNotFound(id))?;

        let published = run
            .into_records()
            .into_iter()
            .map(|input| {
                self.broadcaster
                    .publish(input.key, input.payload, input.claimed_at)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(batch = %id, count = published.len(), "batch run completed");
        Ok(published)
    }

    pub fn cancel_batch_run(&self, id: BatchRunId) -> Result<()> {
        self.batches
            .remove(id)
            .ok_or(LastPriceError::BatchNotFound(id))?;
        debug!(batch = %id, "batch run cancelled");
        Ok(())
    }

    /// Remove runs idle for longer than the abandoned timeout. The janitor
    /// calls this periodically; returns how many were removed.
    pub fn sweep_abandoned_batch_runs(&self) -> usize {
        self.batches
            .remove_outdated(self.config.abandoned_batch_run_timeout(), None)
            .len()
    }

    pub fn active_batch_runs(&self) -> usize {
        self.batches.len()
    }

    // --- Lifecycle ---

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            broadcast: self.broadcaster.stats(),
            active_batch_runs: self.batches.len(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the janitor and detach every subscriber. Further publishes,
    /// attaches and batch operations fail with [`LastPriceError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(janitor) = self.janitor.lock().take() {
            janitor.stop();
        }

        let registry = self.broadcaster.registry();
        let ids = registry.ids();
        for id in &ids {
            // A concurrent detach may have removed it already.
            let _ = registry.unsubscribe(*id, DetachReason::ShutDown);
        }
        info!(detached = ids.len(), "last-price service shut down");
    }
}

impl Drop for LastPriceService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::LatencyHistogram;
    use crate::types::{UpdateOrigin, Version};
    use std::time::{Duration, Instant};

    fn producer() -> ProducerId {
        ProducerId::new("feed-1")
    }

    fn service(config: ServiceConfig) -> (LastPriceService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
        let service =
            LastPriceService::with_components(config, clock.clone(), Arc::new(NoopLatencyRecorder))
                .unwrap();
        (service, clock)
    }

    fn restricted() -> ServiceConfig {
        ServiceConfig::default().with_default_instruments()
    }

    #[test]
    fn test_publish_and_find() {
        let (svc, _) = service(restricted());
        assert!(svc.find_last_price("AIR").unwrap().is_none());

        svc.publish(&producer(), "AIR", b"101.5".to_vec(), Timestamp(7))
            .unwrap();
        let record = svc.find_last_price("AIR").unwrap().unwrap();
        assert_eq!(record.payload, b"101.5");
        assert_eq!(record.version, Version(1));
        assert_eq!(record.observed_at, Timestamp(1_000));
        assert_eq!(record.claimed_at, Timestamp(7));
    }

    #[test]
    fn test_unsupported_instrument_rejected_everywhere() {
        let (svc, _) = service(restricted());
        let publish = svc.publish(&producer(), "AAPL", vec![], Timestamp(0));
        assert!(matches!(publish, Err(LastPriceError::WrongInstrument(_))));

        let find = svc.find_last_price("AAPL");
        assert!(matches!(find, Err(LastPriceError::WrongInstrument(_))));

        let attach = svc.attach_channel(KeyFilter::keys(["AAPL"]));
        assert!(matches!(attach, Err(LastPriceError::WrongInstrument(_))));
        assert_eq!(svc.stats().broadcast.active_subscribers, 0);
    }

    #[test]
    fn test_attach_channel_streams_snapshot_then_live() {
        let (svc, _) = service(ServiceConfig::default());
        svc.publish(&producer(), "AAPL", b"150.00".to_vec(), Timestamp(0))
            .unwrap();

        let (handle, rx) = svc.attach_channel(KeyFilter::All).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.origin, UpdateOrigin::Snapshot);

        svc.publish(&producer(), "AAPL", b"150.25".to_vec(), Timestamp(0))
            .unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second.origin, UpdateOrigin::Live);
        assert_eq!(second.version(), Version(2));

        svc.detach(handle.id()).unwrap();
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn test_latency_reported_to_recorder() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let histogram = Arc::new(LatencyHistogram::new());
        let svc = LastPriceService::with_components(
            ServiceConfig::default(),
            clock,
            histogram.clone(),
        )
        .unwrap();

        let (handle, rx) = svc.attach_channel(KeyFilter::All).unwrap();
        svc.publish(&producer(), "AIR", vec![], Timestamp(0)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        svc.detach(handle.id()).unwrap();
        handle.join().unwrap();
        assert_eq!(histogram.count(), 1);
    }

    #[test]
    fn test_batch_run_publishes_on_complete() {
        let (svc, _) = service(restricted());
        let id = svc.start_batch_run(&producer()).unwrap();
        svc.upload_chunk(
            &producer(),
            id,
            vec![
                PriceInput::new("AIR", b"1".to_vec(), Timestamp(10)),
                PriceInput::new("VOW", b"2".to_vec(), Timestamp(10)),
            ],
        )
        .unwrap();
        svc.upload_chunk(
            &producer(),
            id,
            vec![PriceInput::new("AIR", b"stale".to_vec(), Timestamp(5))],
        )
        .unwrap();

        // Nothing is visible before completion.
        assert!(svc.find_last_price("AIR").unwrap().is_none());

        let published = svc.complete_batch_run(id).unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(svc.find_last_price("AIR").unwrap().unwrap().payload, b"1");
        assert_eq!(svc.active_batch_runs(), 0);

        let again = svc.complete_batch_run(id);
        assert!(matches!(again, Err(LastPriceError::BatchNotFound(_))));
    }

    #[test]
    fn test_invalid_chunk_rejected_whole() {
        let (svc, _) = service(restricted());
        let id = svc.start_batch_run(&producer()).unwrap();
        let result = svc.upload_chunk(
            &producer(),
            id,
            vec![
                PriceInput::new("AIR", b"1".to_vec(), Timestamp(0)),
                PriceInput::new("AAPL", b"2".to_vec(), Timestamp(0)),
            ],
        );
        assert!(matches!(result, Err(LastPriceError::WrongInstrument(_))));
        assert!(svc.complete_batch_run(id).unwrap().is_empty());
    }

    #[test]
    fn test_too_many_active_batch_runs() {
        let (svc, _) = service(ServiceConfig {
            max_active_batch_runs: 2,
            ..ServiceConfig::default()
        });
        let first = svc.start_batch_run(&producer()).unwrap();
        svc.start_batch_run(&producer()).unwrap();
        let third = svc.start_batch_run(&producer());
        assert!(matches!(third, Err(LastPriceError::TooManyActiveBatchRuns(2))));

        svc.cancel_batch_run(first).unwrap();
        svc.start_batch_run(&producer()).unwrap();
    }

    #[test]
    fn test_sweep_abandoned_batch_runs() {
        let (svc, clock) = service(ServiceConfig::default());
        svc.start_batch_run(&producer()).unwrap();
        clock.advance_millis(1_000);
        assert_eq!(svc.sweep_abandoned_batch_runs(), 0);

        clock.advance_millis(5_000);
        assert_eq!(svc.sweep_abandoned_batch_runs(), 1);
        assert_eq!(svc.active_batch_runs(), 0);
    }

    #[test]
    fn test_janitor_sweeps_periodically() {
        let (svc, clock) = service(ServiceConfig {
            batch_cleanup_interval_ms: 10,
            ..ServiceConfig::default()
        });
        svc.start_batch_run(&producer()).unwrap();
        clock.advance_millis(10_000);

        let deadline = Instant::now() + Duration::from_secs(5);
        while svc.active_batch_runs() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(svc.active_batch_runs(), 0);
    }

    #[test]
    fn test_shutdown_detaches_and_rejects() {
        let (svc, _) = service(ServiceConfig::default());
        let (handle, _rx) = svc.attach_channel(KeyFilter::All).unwrap();

        svc.shutdown();
        assert_eq!(handle.join().unwrap(), 0);
        assert!(svc.is_shut_down());

        let publish = svc.publish(&producer(), "AIR", vec![], Timestamp(0));
        assert!(matches!(publish, Err(LastPriceError::ShutDown)));
        assert!(matches!(
            svc.start_batch_run(&producer()),
            Err(LastPriceError::ShutDown)
        ));
        // Second call is a no-op.
        svc.shutdown();
    }
}
