//! Per-image I/O accounting
//!
//! Completions record their latency here when they resolve, keyed by the
//! operation kind passed to [`AioCompletion::init_time`].
//!
//! [`AioCompletion::init_time`]: crate::completion::AioCompletion::init_time

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::AioType;

/// Bucket upper bounds in microseconds (strict `<`), last bucket unbounded
const BUCKET_BOUNDARIES_US: [u64; 16] = [
    10,
    20,
    50,
    100,
    200,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    20_000,
    50_000,
    100_000,
    200_000,
    500_000,
    u64::MAX,
];

/// Log-bucketed latency histogram
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Bucket counts
    buckets: [AtomicU64; 16],
    /// Total samples
    count: AtomicU64,
    /// Sum of all samples (for average)
    sum: AtomicU64,
    /// Minimum sample
    min: AtomicU64,
    /// Maximum sample
    max: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record a latency sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let idx = BUCKET_BOUNDARIES_US
            .iter()
            .position(|&boundary| latency_us < boundary)
            .unwrap_or(BUCKET_BOUNDARIES_US.len() - 1);

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_us, Ordering::Relaxed);
        self.min.fetch_min(latency_us, Ordering::Relaxed);
        self.max.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn avg(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        self.sum.load(Ordering::Relaxed) / count
    }

    pub fn min(&self) -> u64 {
        let min = self.min.load(Ordering::Relaxed);
        if min == u64::MAX { 0 } else { min }
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding the given percentile (0.0 - 1.0)
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64) * percentile).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_BOUNDARIES_US[i];
            }
        }
        BUCKET_BOUNDARIES_US[BUCKET_BOUNDARIES_US.len() - 1]
    }

    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
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

/// Counters for one operation kind
#[derive(Debug, Default)]
pub struct OpStats {
    /// Resolved operations
    ops: AtomicU64,
    /// Operations that resolved with a negative result
    errors: AtomicU64,
    /// Bytes reported by successful operations
    bytes: AtomicU64,
    /// Time from `init_time` to resolution
    latency: LatencyHistogram,
}

impl OpStats {
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> &LatencyHistogram {
        &self.latency
    }
}

/// I/O statistics for one image
#[derive(Debug, Default)]
pub struct IoStats {
    /// Read operations
    read: OpStats,
    /// Write operations
    write: OpStats,
    /// Discard operations
    discard: OpStats,
    /// Flush operations
    flush: OpStats,
    /// Write-same operations
    write_same: OpStats,
    /// Compare-and-write operations
    compare_and_write: OpStats,
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for an operation kind; `None` for kinds that are not
    /// accounted (generic, open, close)
    pub fn op(&self, aio_type: AioType) -> Option<&OpStats> {
        match aio_type {
            AioType::Read => Some(&self.read),
            AioType::Write => Some(&self.write),
            AioType::Discard => Some(&self.discard),
            AioType::Flush => Some(&self.flush),
            AioType::WriteSame => Some(&self.write_same),
            AioType::CompareAndWrite => Some(&self.compare_and_write),
            AioType::None | AioType::Generic | AioType::Open | AioType::Close => None,
        }
    }

    /// Record a resolved operation with its final result code
    pub fn record(&self, aio_type: AioType, rval: i64, elapsed: Duration) {
        let Some(stats) = self.op(aio_type) else {
            return;
        };

        stats.ops.fetch_add(1, Ordering::Relaxed);
        if rval < 0 {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.bytes.fetch_add(rval.unsigned_abs(), Ordering::Relaxed);
        }
        stats
            .latency
            .record(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    /// Total resolved operations across all kinds
    pub fn total_ops(&self) -> u64 {
        [
            &self.read,
            &self.write,
            &self.discard,
            &self.flush,
            &self.write_same,
            &self.compare_and_write,
        ]
        .iter()
        .map(|s| s.ops())
        .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let histogram = LatencyHistogram::new();
        for _ in 0..50 {
            histogram.record(50);
        }
        for _ in 0..49 {
            histogram.record(150);
        }
        histogram.record(5000);

        assert_eq!(histogram.count(), 100);
        assert_eq!(histogram.min(), 50);
        assert_eq!(histogram.max(), 5000);
        assert_eq!(histogram.p50(), 100);
        assert_eq!(histogram.p99(), 200);
        assert_eq!(histogram.percentile(1.0), 10_000);
    }

    #[test]
    fn test_histogram_reset() {
        let histogram = LatencyHistogram::new();
        histogram.record(100);
        histogram.reset();
        assert_eq!(histogram.count(), 0);
        assert_eq!(histogram.min(), 0);
        assert_eq!(histogram.avg(), 0);
    }

    #[test]
    fn test_record_by_kind() {
        let stats = IoStats::new();
        stats.record(AioType::Read, 4096, Duration::from_micros(120));
        stats.record(AioType::Read, -5, Duration::from_micros(30));
        stats.record(AioType::Flush, 0, Duration::from_micros(10));
        stats.record(AioType::Open, 0, Duration::from_micros(10));

        let read = stats.op(AioType::Read).unwrap();
        assert_eq!(read.ops(), 2);
        assert_eq!(read.errors(), 1);
        assert_eq!(read.bytes(), 4096);
        assert_eq!(read.latency().avg(), 75);
        assert!(stats.op(AioType::Open).is_none());
        assert_eq!(stats.total_ops(), 3);
    }
}
