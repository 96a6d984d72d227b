use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counter set for a cache instance.
///
/// Recorders are commutative relaxed adds, safe to call from any task. When
/// constructed disabled every recorder is a no-op and snapshots stay zero.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    enabled: bool,
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    reads_bytes: AtomicU64,
    writes_bytes: AtomicU64,
    trims_count: AtomicU64,
    trims_bytes: AtomicU64,
    get_calls: AtomicU64,
    get_latency_us_total: AtomicU64,
    set_calls: AtomicU64,
    set_latency_us_total: AtomicU64,
}

impl CacheMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub(crate) fn record_memory_hit(&self) {
        self.add(&self.memory_hits, 1);
    }

    pub(crate) fn record_memory_miss(&self) {
        self.add(&self.memory_misses, 1);
    }

    pub(crate) fn record_disk_hit(&self) {
        self.add(&self.disk_hits, 1);
    }

    pub(crate) fn record_disk_miss(&self) {
        self.add(&self.disk_misses, 1);
    }

    pub(crate) fn record_reads_bytes(&self, bytes: u64) {
        self.add(&self.reads_bytes, bytes);
    }

    pub(crate) fn record_writes_bytes(&self, bytes: u64) {
        self.add(&self.writes_bytes, bytes);
    }

    pub(crate) fn record_trim(&self, deleted_count: u64, deleted_bytes: u64) {
        self.add(&self.trims_count, deleted_count);
        self.add(&self.trims_bytes, deleted_bytes);
    }

    pub(crate) fn record_get(&self, latency: Duration) {
        self.add(&self.get_calls, 1);
        self.add(&self.get_latency_us_total, latency.as_micros() as u64);
    }

    pub(crate) fn record_set(&self, latency: Duration) {
        self.add(&self.set_calls, 1);
        self.add(&self.set_latency_us_total, latency.as_micros() as u64);
    }

    fn add(&self, counter: &AtomicU64, value: u64) {
        if self.enabled {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            disk_misses: self.disk_misses.load(Ordering::Relaxed),
            reads_bytes: self.reads_bytes.load(Ordering::Relaxed),
            writes_bytes: self.writes_bytes.load(Ordering::Relaxed),
            trims_count: self.trims_count.load(Ordering::Relaxed),
            trims_bytes: self.trims_bytes.load(Ordering::Relaxed),
            get_calls: self.get_calls.load(Ordering::Relaxed),
            get_latency_us_total: self.get_latency_us_total.load(Ordering::Relaxed),
            set_calls: self.set_calls.load(Ordering::Relaxed),
            set_latency_us_total: self.set_latency_us_total.load(Ordering::Relaxed),
        }
    }
}

/// Immutable capture of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub reads_bytes: u64,
    pub writes_bytes: u64,
    pub trims_count: u64,
    pub trims_bytes: u64,
    pub get_calls: u64,
    pub get_latency_us_total: u64,
    pub set_calls: u64,
    pub set_latency_us_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = CacheMetrics::new(true);
        metrics.record_memory_hit();
        metrics.record_memory_hit();
        metrics.record_memory_miss();
        metrics.record_reads_bytes(128);
        metrics.record_trim(3, 512);
        metrics.record_get(Duration::from_micros(250));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.memory_hits, 2);
        assert_eq!(snapshot.memory_misses, 1);
        assert_eq!(snapshot.reads_bytes, 128);
        assert_eq!(snapshot.trims_count, 3);
        assert_eq!(snapshot.trims_bytes, 512);
        assert_eq!(snapshot.get_calls, 1);
        assert_eq!(snapshot.get_latency_us_total, 250);
    }

    #[test]
    fn test_disabled_metrics_record_nothing() {
        let metrics = CacheMetrics::new(false);
        metrics.record_memory_hit();
        metrics.record_writes_bytes(4096);
        metrics.record_set(Duration::from_millis(1));
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
