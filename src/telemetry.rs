//! Delivery latency telemetry.
//!
//! Every update handed to a sink reports the nanoseconds elapsed since the
//! store ingested it. [`LatencyHistogram`] is a lock-free fixed-bucket
//! collector good enough for percentile summaries; external metrics systems
//! can implement [`LatencyRecorder`] directly.

use crate::types::SubscriberId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for per-delivery latency samples.
pub trait LatencyRecorder: Send + Sync {
    fn record(&self, subscriber: SubscriberId, latency_ns: u64);
}

/// Discards all samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLatencyRecorder;

impl LatencyRecorder for NoopLatencyRecorder {
    fn record(&self, _subscriber: SubscriberId, _latency_ns: u64) {}
}

/// Number of power-of-two buckets: [0, 2^1), [2^1, 2^2), ... up to 2^40 ns
/// (about 18 minutes). Larger samples land in the last bucket.
const BUCKETS: usize = 40;

/// Lock-free latency histogram with power-of-two buckets.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

/// Point-in-time summary of a histogram. Percentiles are bucket upper bounds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: u64,
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    pub fn record_ns(&self, latency_ns: u64) {
        self.buckets[bucket_index(latency_ns)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_ns, Ordering::Relaxed);
        self.min.fetch_min(latency_ns, Ordering::Relaxed);
        self.max.fetch_max(latency_ns, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket containing the `quantile` (0.0..=1.0)
    /// sample, or 0 if empty.
    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        let rank = ((quantile.clamp(0.0, 1.0) * count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (i, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                return bucket_upper_bound(i).min(self.max.load(Ordering::Relaxed));
            }
        }
        self.max.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> LatencySummary {
        let count = self.count();
        if count == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            count,
            min_ns: self.min.load(Ordering::Relaxed),
            max_ns: self.max.load(Ordering::Relaxed),
            mean_ns: self.sum.load(Ordering::Relaxed) / count,
            p50_ns: self.value_at_quantile(0.50),
            p90_ns: self.value_at_quantile(0.90),
            p99_ns: self.value_at_quantile(0.99),
            p999_ns: self.value_at_quantile(0.999),
        }
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyRecorder for LatencyHistogram {
    fn record(&self, _subscriber: SubscriberId, latency_ns: u64) {
        self.record_ns(latency_ns);
    }
}

fn bucket_index(latency_ns: u64) -> usize {
    // Bucket i holds [2^i, 2^(i+1)); 0 shares bucket 0 with 1.
    let bits = (u64::BITS - latency_ns.leading_zeros()) as usize;
    bits.saturating_sub(1).min(BUCKETS - 1)
}

fn bucket_upper_bound(index: usize) -> u64 {
    if index + 1 >= BUCKETS {
        u64::MAX
    } else {
        (1u64 << (index + 1)) - 1
    }
}
