//! Meter Statistics
//!
//! Lock-free per-meter counters and the aggregator that folds them into one
//! performance report.
//!
//! Capture-level counters (drops, ignores) have platform-dependent meaning:
//! some capture stacks keep one counter per worker, others expose a single
//! counter that every worker reads identically. The source declares which
//! one it has and a [`Reconciliation`] strategy is picked once at startup.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Capture counters reported by a packet source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Packets dropped before reaching user space
    pub dropped: u64,
    /// Packets the capture layer saw but did not deliver
    pub ignored: u64,
}

/// How the capture layer's counters relate across workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CounterSemantics {
    /// Each worker owns an independent counter
    PerWorker,
    /// One counter, visible identically from every worker
    #[default]
    Shared,
}

impl CounterSemantics {
    /// Strategy for this platform
    pub fn reconciliation(self) -> &'static dyn Reconciliation {
        match self {
            Self::PerWorker => &Additive,
            Self::Shared => &SharedMax,
        }
    }
}

/// Turns per-worker capture counters into published values and back into
/// one total
pub trait Reconciliation: Send + Sync {
    /// Combine a worker's published value into the running total
    fn fold(&self, total: u64, value: u64) -> u64;

    /// Value worker `worker` publishes, given what was attributed to each
    /// worker
    fn project(&self, attributed: &[u64], worker: usize) -> u64;

    /// Fold every published value
    fn reduce(&self, values: &[u64]) -> u64 {
        values.iter().fold(0, |total, &v| self.fold(total, v))
    }
}

/// Independent counters: each worker publishes its own share, totals add up
#[derive(Debug, Clone, Copy)]
pub struct Additive;

impl Reconciliation for Additive {
    #[inline]
    fn fold(&self, total: u64, value: u64) -> u64 {
        total + value
    }

    #[inline]
    fn project(&self, attributed: &[u64], worker: usize) -> u64 {
        attributed.get(worker).copied().unwrap_or(0)
    }
}

/// Shared counter: every worker sees the whole value, summing would over-count
#[derive(Debug, Clone, Copy)]
pub struct SharedMax;

impl Reconciliation for SharedMax {
    #[inline]
    fn fold(&self, total: u64, value: u64) -> u64 {
        total.max(value)
    }

    #[inline]
    fn project(&self, attributed: &[u64], _worker: usize) -> u64 {
        attributed.iter().sum()
    }
}

/// Per-meter counters (cache-line aligned)
#[repr(C, align(64))]
pub struct MeterCounters {
    /// Packets metered
    pub processed: AtomicU64,
    /// Packets ignored by filter or capture layer
    pub ignored: AtomicU64,
    /// Packets dropped before user space
    pub dropped: AtomicU64,
    /// Flows expired
    pub expired: AtomicU64,
}

impl Default for MeterCounters {
    fn default() -> Self {
        Self {
            processed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }
}

impl MeterCounters {
    #[inline(always)]
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite capture-level counters with their latest projection
    #[inline]
    pub fn publish_capture(&self, ignored: u64, dropped: u64) {
        self.ignored.store(ignored, Ordering::Relaxed);
        self.dropped.store(dropped, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MeterCountersSnapshot {
        MeterCountersSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Counter snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterCountersSnapshot {
    pub processed: u64,
    pub ignored: u64,
    pub dropped: u64,
    pub expired: u64,
}

/// Counter sets of every meter in a run
pub struct MeterStats {
    meters: Vec<MeterCounters>,
}

impl MeterStats {
    pub fn new(num_meters: usize) -> Self {
        let mut meters = Vec::with_capacity(num_meters);
        for _ in 0..num_meters {
            meters.push(MeterCounters::default());
        }
        Self { meters }
    }

    pub fn meter(&self, idx: usize) -> &MeterCounters {
        &self.meters[idx]
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }
}

/// One telemetry snapshot, printed as a JSON line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PerformanceReport {
    pub expired_flows: u64,
    pub packets_processed: u64,
    pub packets_ignored: u64,
    pub packets_dropped_filtered_by_kernel: u64,
    pub meters_packets_load_balance: Vec<u64>,
}

impl PerformanceReport {
    /// Single-line JSON form
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Pull-based reader over all meters' counters
#[derive(Clone)]
pub struct PerformanceAggregator {
    stats: Arc<MeterStats>,
    reconciliation: &'static dyn Reconciliation,
}

impl PerformanceAggregator {
    pub fn new(stats: Arc<MeterStats>, semantics: CounterSemantics) -> Self {
        Self {
            stats,
            reconciliation: semantics.reconciliation(),
        }
    }

    /// Read every meter's counters and build one report
    pub fn report(&self) -> PerformanceReport {
        let snapshots: Vec<_> = self.stats.meters.iter().map(MeterCounters::snapshot).collect();
        let dropped: Vec<u64> = snapshots.iter().map(|s| s.dropped).collect();
        let ignored: Vec<u64> = snapshots.iter().map(|s| s.ignored).collect();

        PerformanceReport {
            expired_flows: snapshots.iter().map(|s| s.expired).sum(),
            packets_processed: snapshots.iter().map(|s| s.processed).sum(),
            packets_ignored: self.reconciliation.reduce(&ignored),
            packets_dropped_filtered_by_kernel: self.reconciliation.reduce(&dropped),
            meters_packets_load_balance: snapshots.iter().map(|s| s.processed).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(stats: &MeterStats, semantics: CounterSemantics, ignored: &[u64], dropped: &[u64]) {
        let r = semantics.reconciliation();
        for worker in 0..stats.len() {
            stats
                .meter(worker)
                .publish_capture(r.project(ignored, worker), r.project(dropped, worker));
        }
    }

    #[test]
    fn test_meter_counters() {
        let counters = MeterCounters::default();
        counters.record_processed();
        counters.record_processed();
        counters.record_expired();
        counters.publish_capture(3, 4);

        let snap = counters.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.expired, 1);
        assert_eq!(snap.ignored, 3);
        assert_eq!(snap.dropped, 4);
    }

    #[test]
    fn test_per_worker_counters_are_summed() {
        let stats = Arc::new(MeterStats::new(3));
        publish(&stats, CounterSemantics::PerWorker, &[1, 2, 3], &[10, 20, 30]);
        stats.meter(0).record_processed();
        stats.meter(2).record_processed();

        let report = PerformanceAggregator::new(stats, CounterSemantics::PerWorker).report();
        assert_eq!(report.packets_ignored, 6);
        assert_eq!(report.packets_dropped_filtered_by_kernel, 60);
        assert_eq!(report.packets_processed, 2);
        assert_eq!(report.meters_packets_load_balance, vec![1, 0, 1]);
    }

    #[test]
    fn test_shared_counters_take_max() {
        let stats = Arc::new(MeterStats::new(4));
        publish(&stats, CounterSemantics::Shared, &[5, 0, 0, 0], &[7, 0, 0, 0]);

        // every worker sees the whole shared value
        for worker in 0..4 {
            assert_eq!(stats.meter(worker).snapshot().dropped, 7);
        }

        let report = PerformanceAggregator::new(stats, CounterSemantics::Shared).report();
        assert_eq!(report.packets_ignored, 5);
        assert_eq!(report.packets_dropped_filtered_by_kernel, 7);
    }

    #[test]
    fn test_semantics_agree_on_totals() {
        let attributed = [4, 9, 1];
        for semantics in [CounterSemantics::PerWorker, CounterSemantics::Shared] {
            let stats = Arc::new(MeterStats::new(3));
            publish(&stats, semantics, &attributed, &attributed);
            let report = PerformanceAggregator::new(stats, semantics).report();
            assert_eq!(report.packets_dropped_filtered_by_kernel, 14, "{semantics:?}");
        }
    }

    #[test]
    fn test_report_json_line() {
        let report = PerformanceReport {
            expired_flows: 2,
            packets_processed: 30,
            packets_ignored: 1,
            packets_dropped_filtered_by_kernel: 0,
            meters_packets_load_balance: vec![10, 20],
        };
        assert_eq!(
            report.to_json_line(),
            r#"{"expired_flows":2,"packets_processed":30,"packets_ignored":1,"packets_dropped_filtered_by_kernel":0,"meters_packets_load_balance":[10,20]}"#
        );
    }
}
