//! Scheduler statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::ExpireReason;

/// Anticipation waits longer than this are discarded as absurd.
const AS_WAIT_ABSURD_US: u64 = 10_000_000;

/// Snapshot of a device scheduler's statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BfqStats {
    /// Requests accepted by `enqueue`.
    pub enqueued: u64,
    /// Requests rejected by `enqueue`.
    pub rejected: u64,
    /// Requests handed to the driver.
    pub dispatched: u64,
    /// Completions observed.
    pub completed: u64,
    /// Requests cancelled by `cancel_all`.
    pub cancelled: u64,
    /// Expiries for slice timeout.
    pub expired_timeout: u64,
    /// Expiries for idling through an anticipation wait.
    pub expired_too_idle: u64,
    /// Expiries for budget exhaustion.
    pub expired_out_of_budget: u64,
    /// Budget underflows that were clamped.
    pub budget_underflows: u64,
    /// Anticipation waits started.
    pub as_armed: u64,
    /// Waits ended by the awaited submitter issuing a request.
    pub as_hits: u64,
    /// Waits ended by the timer.
    pub as_misses: u64,
    /// Timer fires that found nothing to do.
    pub as_fake_timeouts: u64,
    /// Waits abandoned because the awaited submitter was destroyed.
    pub as_destroyed: u64,
    /// Average wait over all waits, in microseconds.
    pub as_avg_wait_all_us: u64,
    /// Average wait over missed waits, in microseconds.
    pub as_avg_wait_miss_us: u64,
    /// Longest wait observed, in microseconds.
    pub as_max_wait_us: u64,
    /// Waits longer than five seeky wait periods.
    pub as_high_wait_count: u64,
    /// Average activation length at slice timeout, in microseconds.
    pub avg_time_slice_us: u64,
    /// Longest activation observed at slice timeout, in microseconds.
    pub max_time_slice_us: u64,
    /// Activations longer than three slice timeouts.
    pub high_time_slice_count: u64,
    /// Peak-rate estimate (fixed-point bytes/us).
    pub peak_rate: u64,
    /// Peak-rate samples taken.
    pub peak_rate_samples: u64,
    /// Current max budget.
    pub max_budget: u64,
    /// Submitters waiting in the WF2Q tree.
    pub ready_submitters: usize,
}

/// Counters updated under the device lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceCounters {
    pub(crate) rejected: u64,
    pub(crate) cancelled: u64,
    pub(crate) expired_timeout: u64,
    pub(crate) expired_too_idle: u64,
    pub(crate) expired_out_of_budget: u64,
    pub(crate) budget_underflows: u64,
    pub(crate) as_armed: u64,
    pub(crate) as_hits: u64,
    pub(crate) as_misses: u64,
    pub(crate) as_fake_timeouts: u64,
    pub(crate) as_destroyed: u64,
    pub(crate) as_wait: AsWaitStats,
}

impl DeviceCounters {
    pub(crate) fn record_expire(&mut self, reason: ExpireReason) {
        match reason {
            ExpireReason::Timeout => self.expired_timeout += 1,
            ExpireReason::TooIdle => self.expired_too_idle += 1,
            ExpireReason::OutOfBudget => self.expired_out_of_budget += 1,
        }
    }
}

/// Anticipation wait-length statistics.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AsWaitStats {
    pub(crate) avg_all_us: u64,
    pub(crate) avg_miss_us: u64,
    pub(crate) max_us: u64,
    pub(crate) high_count: u64,
}

impl AsWaitStats {
    /// Folds in one finished wait. `high_us` is the threshold for the
    /// high-wait counter.
    pub(crate) fn record(&mut self, wait_us: u64, missed: bool, high_us: u64) {
        if wait_us > AS_WAIT_ABSURD_US {
            debug!(wait_us, "absurd AS wait, ignored");
            return;
        }
        if wait_us > high_us {
            self.high_count += 1;
        }
        self.avg_all_us = (7 * self.avg_all_us + wait_us) / 8;
        if missed {
            self.avg_miss_us = (7 * self.avg_miss_us + wait_us) / 8;
        }
        self.max_us = self.max_us.max(wait_us);
    }
}

/// Counters updated without the device lock.
#[derive(Debug, Default)]
pub(crate) struct AtomicCounters {
    pub(crate) enqueued: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) completed: AtomicU64,
    avg_time_slice_us: AtomicU64,
    max_time_slice_us: AtomicU64,
    high_time_slice_count: AtomicU64,
}

impl AtomicCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the length of a slice that ran into the timeout.
    pub(crate) fn record_time_slice(&self, slice_us: u64, slice_timeout_us: u64) {
        if slice_us > 3 * slice_timeout_us {
            Self::bump(&self.high_time_slice_count);
        }
        let _ = self
            .avg_time_slice_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |avg| {
                Some((7 * avg + slice_us) / 8)
            });
        self.max_time_slice_us.fetch_max(slice_us, Ordering::Relaxed);
    }

    pub(crate) fn fill(&self, stats: &mut BfqStats) {
        stats.enqueued = self.enqueued.load(Ordering::Relaxed);
        stats.dispatched = self.dispatched.load(Ordering::Relaxed);
        stats.completed = self.completed.load(Ordering::Relaxed);
        stats.avg_time_slice_us = self.avg_time_slice_us.load(Ordering::Relaxed);
        stats.max_time_slice_us = self.max_time_slice_us.load(Ordering::Relaxed);
        stats.high_time_slice_count = self.high_time_slice_count.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_wait_ewma_and_max() {
        let mut w = AsWaitStats::default();
        w.record(8_000, false, 5_000);
        assert_eq!(w.avg_all_us, 1_000);
        assert_eq!(w.avg_miss_us, 0);
        assert_eq!(w.max_us, 8_000);
        assert_eq!(w.high_count, 1);

        w.record(800, true, 5_000);
        assert_eq!(w.avg_all_us, (7 * 1_000 + 800) / 8);
        assert_eq!(w.avg_miss_us, 100);
        assert_eq!(w.max_us, 8_000);
        assert_eq!(w.high_count, 1);
    }

    #[test]
    fn test_as_wait_absurd_discarded() {
        let mut w = AsWaitStats::default();
        w.record(20_000_000, true, 5_000);
        assert_eq!(w.max_us, 0);
        assert_eq!(w.high_count, 0);
    }

    #[test]
    fn test_time_slice_recording() {
        let c = AtomicCounters::default();
        c.record_time_slice(100_000, 100_000);
        c.record_time_slice(400_000, 100_000);
        let mut stats = BfqStats::default();
        c.fill(&mut stats);
        assert_eq!(stats.max_time_slice_us, 400_000);
        assert_eq!(stats.high_time_slice_count, 1);
        assert_eq!(stats.avg_time_slice_us, (7 * 12_500 + 400_000) / 8);
    }

    #[test]
    fn test_record_expire_by_reason() {
        let mut c = DeviceCounters::default();
        c.record_expire(ExpireReason::Timeout);
        c.record_expire(ExpireReason::OutOfBudget);
        c.record_expire(ExpireReason::OutOfBudget);
        assert_eq!(c.expired_timeout, 1);
        assert_eq!(c.expired_too_idle, 0);
        assert_eq!(c.expired_out_of_budget, 2);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = BfqStats {
            dispatched: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"dispatched\":3"));
    }
}
