// Executor metrics
//
// Counters and gauges owned by one Executor; nothing here is global.
// Invariant: every terminal result, rejection, limit violation and cleanup
// outcome is counted exactly once.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::types::{LimitKind, OutcomeKind, RejectReason};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    // Outcomes
    pub executions_total: Counter,
    pub outcome_completed: Counter,
    pub outcome_timed_out: Counter,
    pub outcome_limit_exceeded: Counter,
    pub outcome_crashed: Counter,
    pub outcome_rejected: Counter,
    pub outcome_launch_failure: Counter,
    pub cancelled: Counter,

    // Rejections
    pub rejected_queue_full: Counter,
    pub rejected_queue_timeout: Counter,
    pub rejected_cancelled: Counter,
    pub rejected_source_too_large: Counter,
    pub rejected_invalid_limits: Counter,

    // Limit violations
    pub limit_violations_memory: Counter,
    pub limit_violations_cpu: Counter,
    pub limit_violations_file_size: Counter,
    pub limit_violations_processes: Counter,
    pub output_truncated: Counter,

    // Teardown
    pub cleanup_success: Counter,
    pub cleanup_failure: Counter,
    pub invariant_violations: Counter,
    pub orphans_reaped: Counter,

    pub active_runs: Gauge,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, kind: OutcomeKind, cancelled: bool) {
        self.executions_total.inc();
        match kind {
            OutcomeKind::Completed => self.outcome_completed.inc(),
            OutcomeKind::TimedOut => self.outcome_timed_out.inc(),
            OutcomeKind::LimitExceeded => self.outcome_limit_exceeded.inc(),
            OutcomeKind::Crashed => self.outcome_crashed.inc(),
            OutcomeKind::Rejected => self.outcome_rejected.inc(),
            OutcomeKind::LaunchFailure => self.outcome_launch_failure.inc(),
        }
        if cancelled {
            self.cancelled.inc();
        }
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        match reason {
            RejectReason::QueueFull => self.rejected_queue_full.inc(),
            RejectReason::QueueTimeout => self.rejected_queue_timeout.inc(),
            RejectReason::Cancelled => self.rejected_cancelled.inc(),
            RejectReason::SourceTooLarge => self.rejected_source_too_large.inc(),
            RejectReason::InvalidLimits => self.rejected_invalid_limits.inc(),
        }
    }

    pub fn record_limit_violation(&self, limit: LimitKind) {
        match limit {
            LimitKind::Memory => self.limit_violations_memory.inc(),
            LimitKind::CpuTime => self.limit_violations_cpu.inc(),
            LimitKind::FileSize => self.limit_violations_file_size.inc(),
            LimitKind::Processes => self.limit_violations_processes.inc(),
        }
    }

    pub fn record_cleanup(&self, clean: bool) {
        if clean {
            self.cleanup_success.inc();
        } else {
            self.cleanup_failure.inc();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions_total: self.executions_total.get(),
            outcomes: OutcomeCounts {
                completed: self.outcome_completed.get(),
                timed_out: self.outcome_timed_out.get(),
                killed_over_limit: self.outcome_limit_exceeded.get(),
                crashed: self.outcome_crashed.get(),
                rejected: self.outcome_rejected.get(),
                launch_failure: self.outcome_launch_failure.get(),
                cancelled: self.cancelled.get(),
            },
            rejections: RejectionCounts {
                queue_full: self.rejected_queue_full.get(),
                queue_timeout: self.rejected_queue_timeout.get(),
                cancelled: self.rejected_cancelled.get(),
                source_too_large: self.rejected_source_too_large.get(),
                invalid_limits: self.rejected_invalid_limits.get(),
            },
            limit_violations: LimitCounts {
                memory: self.limit_violations_memory.get(),
                cpu_time: self.limit_violations_cpu.get(),
                file_size: self.limit_violations_file_size.get(),
                processes: self.limit_violations_processes.get(),
            },
            output_truncated: self.output_truncated.get(),
            cleanup_success: self.cleanup_success.get(),
            cleanup_failure: self.cleanup_failure.get(),
            invariant_violations: self.invariant_violations.get(),
            orphans_reaped: self.orphans_reaped.get(),
            active_runs: self.active_runs.get(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub completed: u64,
    pub timed_out: u64,
    pub killed_over_limit: u64,
    pub crashed: u64,
    pub rejected: u64,
    pub launch_failure: u64,
    pub cancelled: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub queue_full: u64,
    pub queue_timeout: u64,
    pub cancelled: u64,
    pub source_too_large: u64,
    pub invalid_limits: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCounts {
    pub memory: u64,
    pub cpu_time: u64,
    pub file_size: u64,
    pub processes: u64,
}

/// Point-in-time copy of every metric
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub executions_total: u64,
    pub outcomes: OutcomeCounts,
    pub rejections: RejectionCounts,
    pub limit_violations: LimitCounts,
    pub output_truncated: u64,
    pub cleanup_success: u64,
    pub cleanup_failure: u64,
    pub invariant_violations: u64,
    pub orphans_reaped: u64,
    pub active_runs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let gauge = Gauge::new();
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.set(7);
        assert_eq!(gauge.get(), 7);
    }

    #[test]
    fn test_outcomes_are_counted() {
        let metrics = ExecutorMetrics::new();
        metrics.record_outcome(OutcomeKind::Completed, false);
        metrics.record_outcome(OutcomeKind::TimedOut, true);
        metrics.record_outcome(OutcomeKind::Rejected, false);
        metrics.record_rejection(RejectReason::QueueFull);
        metrics.record_limit_violation(LimitKind::Memory);

        let snap = metrics.snapshot();
        assert_eq!(snap.executions_total, 3);
        assert_eq!(snap.outcomes.completed, 1);
        assert_eq!(snap.outcomes.timed_out, 1);
        assert_eq!(snap.outcomes.cancelled, 1);
        assert_eq!(snap.rejections.queue_full, 1);
        assert_eq!(snap.limit_violations.memory, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ExecutorMetrics::new();
        metrics.record_cleanup(true);
        metrics.record_cleanup(false);
        let value = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(value["cleanup_success"], 1);
        assert_eq!(value["cleanup_failure"], 1);
        assert_eq!(value["outcomes"]["killed_over_limit"], 0);
    }
}
