use crate::snapshot::{InstanceDispatchMetrics, MetricsSnapshot, OperationMetrics};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Decades covered by the histogram (1µs up to 10^10µs).
const DECADES: usize = 10;
const NUM_BINS: usize = DECADES * 10;

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Log-linear latency histogram.
///
/// Values below 10µs get one bin each. Above that, every decade is split by
/// its leading digit, so `4_200µs` lands in the `4_000..5_000` bin. Recording
/// is a single atomic increment; percentiles interpolate inside a bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_BINS],
    total_latency: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::bin_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn bin_for(latency_us: u64) -> usize {
        if latency_us < 10 {
            return latency_us as usize;
        }
        let decade = (latency_us.ilog10() as usize).min(DECADES - 1);
        let lead = (latency_us / 10u64.pow(decade as u32)).min(9) as usize;
        decade * 10 + lead
    }

    /// Returns the `[low, high)` range covered by a bin.
    fn bin_range(bin: usize) -> (u64, u64) {
        if bin < 10 {
            return (bin as u64, bin as u64 + 1);
        }
        let scale = 10u64.pow((bin / 10) as u32);
        let lead = (bin % 10) as u64;
        (lead * scale, (lead + 1) * scale)
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut seen = 0u64;
        for (bin, counter) in self.bins.iter().enumerate() {
            let count = counter.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if seen + count >= target {
                let (low, high) = Self::bin_range(bin);
                let fraction = (target - seen) as f64 / count as f64;
                return low + (fraction * (high - low) as f64) as u64;
            }
            seen += count;
        }

        Self::bin_range(NUM_BINS - 1).1
    }

    fn average(&self) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        self.total_latency.load(Ordering::Relaxed) / total
    }
}

#[derive(Debug)]
struct OperationStats {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    latency: LatencyHistogram,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self) -> OperationMetrics {
        OperationMetrics {
            call_count: self.calls.load(Ordering::Relaxed),
            success_count: self.successes.load(Ordering::Relaxed),
            failure_count: self.failures.load(Ordering::Relaxed),
            avg_latency_us: self.latency.average(),
            p50_latency_us: self.latency.percentile(50),
            p95_latency_us: self.latency.percentile(95),
            p99_latency_us: self.latency.percentile(99),
        }
    }
}

#[derive(Debug)]
struct InstanceStats {
    dispatched: AtomicU64,
    failed: AtomicU64,
    last_dispatch_ms: AtomicU64,
}

impl InstanceStats {
    fn new() -> Self {
        Self {
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_dispatch_ms: AtomicU64::new(0),
        }
    }
}

/// Thread-safe storage for service metrics.
///
/// Counters are lock-free atomics with relaxed ordering; the operation and
/// instance maps take a short write lock only when a new key first appears.
///
/// # Example
///
/// ```rust
/// use wrapmgr_metrics::MetricsRegistry;
///
/// let registry = MetricsRegistry::new();
/// registry.record_operation("decrypt", 150, true);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_calls, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    active_streams: AtomicU64,
    operations: RwLock<HashMap<String, Arc<OperationStats>>>,
    instances: RwLock<HashMap<String, Arc<InstanceStats>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            active_streams: AtomicU64::new(0),
            operations: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Records one completed operation.
    ///
    /// # Arguments
    /// * `operation` - Operation name, e.g. `Decrypt` or `M3U8`
    /// * `latency_us` - Wall time of the call in microseconds
    /// * `success` - Whether the reply carried a success code
    pub fn record_operation(&self, operation: &str, latency_us: u64, success: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        let stats = self.operation_entry(operation);
        stats.calls.fetch_add(1, Ordering::Relaxed);
        if success {
            stats.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        stats.latency.record(latency_us);
    }

    /// Records that a task was routed to an instance.
    pub fn record_dispatch(&self, instance_id: &str, success: bool) {
        let stats = self.instance_entry(instance_id);
        stats.dispatched.fetch_add(1, Ordering::Relaxed);
        if !success {
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        stats.last_dispatch_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Drops dispatch statistics for an instance that left the pool.
    pub fn forget_instance(&self, instance_id: &str) -> bool {
        self.instances.write().remove(instance_id).is_some()
    }

    pub fn increment_active_streams(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_active_streams(&self) {
        // Saturate so an unbalanced decrement cannot wrap the gauge.
        let _ = self
            .active_streams
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Copies every counter into a serializable snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self
            .operations
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        let instances = self
            .instances
            .read()
            .iter()
            .map(|(id, stats)| {
                (
                    id.clone(),
                    InstanceDispatchMetrics {
                        instance_id: id.clone(),
                        dispatch_count: stats.dispatched.load(Ordering::Relaxed),
                        failure_count: stats.failed.load(Ordering::Relaxed),
                        last_dispatch_ms: stats.last_dispatch_ms.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms: self.uptime_ms(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            operations,
            instances,
        }
    }

    // The read guard must be gone before `write()`; parking_lot locks are
    // not reentrant.
    fn instance_entry(&self, instance_id: &str) -> Arc<InstanceStats> {
        if let Some(stats) = self.instances.read().get(instance_id) {
            return stats.clone();
        }
        self.instances
            .write()
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(InstanceStats::new()))
            .clone()
    }

    fn operation_entry(&self, operation: &str) -> Arc<OperationStats> {
        if let Some(stats) = self.operations.read().get(operation) {
            return stats.clone();
        }
        self.operations
            .write()
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(OperationStats::new()))
            .clone()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
