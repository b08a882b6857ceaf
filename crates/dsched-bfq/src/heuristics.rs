//! Per-submitter locality and think-time estimators, and the per-device
//! peak-rate estimator.
//!
//! All averages are fixed-point exponentially weighted with weight 7/8. The
//! sample count is itself weighted: it converges to 256 and crosses
//! [`VALID_MIN_SAMPLES`] after a handful of observations.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::{FIXPOINT_SHIFT, VALID_MIN_SAMPLES};

/// Shortest activation, in microseconds, that yields a peak-rate sample.
const PEAK_RATE_MIN_INTERVAL_US: u64 = 2_000;

/// Shortest activation, in microseconds, that may be judged slow.
const SLOW_MIN_INTERVAL_US: u64 = 20_000;

/// Fixed-point EWMA with a weighted sample count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedEwma {
    samples: u64,
    total: u128,
    avg: u64,
}

impl FixedEwma {
    /// Weighted number of samples folded in so far.
    #[inline]
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Current average.
    #[inline]
    pub fn avg(&self) -> u64 {
        self.avg
    }

    /// True once enough samples exist for the average to be meaningful.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.samples >= VALID_MIN_SAMPLES
    }

    fn is_seeded(&self) -> bool {
        self.samples != 0
    }

    fn seed(&mut self) {
        self.samples = 1;
    }

    fn add(&mut self, value: u64) {
        self.samples = (7 * self.samples + 256) / 8;
        // Scaled by 256, so the total needs more than 64 bits.
        self.total = (7 * self.total + 256 * u128::from(value)) / 8;
        let avg = (self.total + u128::from(self.samples / 2)) / u128::from(self.samples);
        self.avg = u64::try_from(avg).unwrap_or(u64::MAX);
    }
}

/// Seek-distance estimator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SeekStats {
    ewma: FixedEwma,
    last_end: u64,
}

impl SeekStats {
    /// Folds in a read/write request at `offset` of `size` bytes.
    ///
    /// The first request only records where it ends.
    pub fn update(&mut self, offset: u64, size: u64) {
        if self.ewma.is_seeded() {
            let seek = offset.abs_diff(self.last_end);
            self.ewma.add(seek);
            trace!(seek, avg = self.ewma.avg(), "seek average updated");
        } else {
            self.ewma.seed();
        }
        self.last_end = offset.saturating_add(size);
    }

    /// Average seek distance in bytes.
    #[inline]
    pub fn avg(&self) -> u64 {
        self.ewma.avg()
    }

    /// Weighted sample count.
    #[inline]
    pub fn samples(&self) -> u64 {
        self.ewma.samples()
    }

    /// True if enough samples exist.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.ewma.is_valid()
    }

    /// True if the submitter has poor spatial locality.
    #[inline]
    pub fn is_seeky(&self, threshold: u64) -> bool {
        self.ewma.is_valid() && self.ewma.avg() > threshold
    }
}

/// Inter-submission think-time estimator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ThinkTimeStats {
    ewma: FixedEwma,
    last_submit_us: u64,
}

impl ThinkTimeStats {
    /// Folds in a submission at `now_us`.
    ///
    /// The sample is dropped if the clock appears to have gone backwards, or
    /// if the last completion happened before the current activation started.
    pub fn update(&mut self, now_us: u64, last_done_us: u64, service_start_us: u64) {
        if !self.ewma.is_seeded() {
            self.ewma.seed();
        } else if now_us >= self.last_submit_us && last_done_us >= service_start_us {
            self.ewma.add(now_us - self.last_submit_us);
        }
        self.last_submit_us = now_us;
    }

    /// Average think time in microseconds.
    #[inline]
    pub fn avg_us(&self) -> u64 {
        self.ewma.avg()
    }

    /// Weighted sample count.
    #[inline]
    pub fn samples(&self) -> u64 {
        self.ewma.samples()
    }

    /// True if the submitter thinks longer than `wait_us` between requests
    /// and has already used more than an eighth of its budget.
    pub fn is_slow_thinker(&self, wait_us: u64, service_received: u64, budget: u64) -> bool {
        self.ewma.samples() > VALID_MIN_SAMPLES
            && self.ewma.avg() > wait_us
            && service_received > budget / 8
    }
}

/// Device peak-throughput estimator, in fixed-point bytes per microsecond.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PeakRate {
    rate: u64,
    samples: u64,
}

impl PeakRate {
    /// Current estimate (bytes/us, shifted left by [`FIXPOINT_SHIFT`]).
    #[inline]
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Number of samples taken (saturates at [`VALID_MIN_SAMPLES`]).
    #[inline]
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Folds in `service` bytes delivered over `elapsed_us`.
    ///
    /// Returns the max budget implied by the new estimate once enough
    /// samples have accumulated.
    pub fn sample(&mut self, service: u64, elapsed_us: u64, slice_timeout_us: u64) -> Option<u64> {
        if elapsed_us < PEAK_RATE_MIN_INTERVAL_US || elapsed_us > slice_timeout_us {
            debug!(elapsed_us, "absurd interval for peak rate, sample discarded");
            return None;
        }

        let rate = (service << FIXPOINT_SHIFT) / elapsed_us;
        self.rate = (rate + 7 * self.rate) / 8;
        self.samples += 1;

        if self.samples > VALID_MIN_SAMPLES {
            self.samples = VALID_MIN_SAMPLES;
            Some(slice_timeout_us.saturating_mul(self.rate) >> FIXPOINT_SHIFT)
        } else {
            None
        }
    }
}

/// Judges whether a submitter, at the rate it achieved in this activation,
/// would fail to consume two thirds of its budget within one slice.
pub fn is_slow(service: u64, elapsed_us: u64, budget: u64, slice_timeout_us: u64) -> bool {
    if elapsed_us < SLOW_MIN_INTERVAL_US {
        return false;
    }
    let speed = (service << FIXPOINT_SHIFT) / elapsed_us;
    let expect = speed.saturating_mul(slice_timeout_us) >> FIXPOINT_SHIFT;
    expect < budget * 2 / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_sample_count_converges() {
        let mut ewma = FixedEwma::default();
        ewma.seed();
        assert_eq!(ewma.samples(), 1);
        ewma.add(0);
        assert_eq!(ewma.samples(), 32);
        ewma.add(0);
        assert_eq!(ewma.samples(), 60);
        assert!(!ewma.is_valid());
        ewma.add(0);
        assert_eq!(ewma.samples(), 84);
        assert!(ewma.is_valid());
        for _ in 0..100 {
            ewma.add(0);
        }
        assert!(ewma.samples() <= 256);
    }

    #[test]
    fn test_ewma_constant_input_converges_to_value() {
        let mut ewma = FixedEwma::default();
        ewma.seed();
        for _ in 0..200 {
            ewma.add(1000);
        }
        // Integer truncation biases the weighted count low by a few percent.
        let avg = ewma.avg();
        assert!((1000..=1050).contains(&avg), "avg={}", avg);
    }

    #[test]
    fn test_ewma_huge_values_do_not_saturate() {
        let huge = 1u64 << 60;
        let mut ewma = FixedEwma::default();
        ewma.seed();
        for _ in 0..200 {
            ewma.add(huge);
        }
        let avg = ewma.avg();
        assert!(avg >= huge && avg <= huge + huge / 20, "avg={}", avg);

        // Falls back once the huge samples stop.
        for _ in 0..200 {
            ewma.add(0);
        }
        assert!(ewma.avg() < huge / 1000, "avg={}", ewma.avg());

        let mut max = FixedEwma::default();
        max.seed();
        max.add(u64::MAX);
        assert_eq!(max.avg(), u64::MAX);
    }

    #[test]
    fn test_seek_first_request_only_seeds() {
        let mut seek = SeekStats::default();
        seek.update(1 << 30, 4096);
        assert_eq!(seek.samples(), 1);
        assert_eq!(seek.avg(), 0);
    }

    #[test]
    fn test_sequential_stream_is_not_seeky() {
        let mut seek = SeekStats::default();
        let mut offset = 0;
        for _ in 0..20 {
            seek.update(offset, 4096);
            offset += 4096;
        }
        assert!(seek.is_valid());
        assert_eq!(seek.avg(), 0);
        assert!(!seek.is_seeky(512 * 1024));
    }

    #[test]
    fn test_random_stream_is_seeky() {
        let mut seek = SeekStats::default();
        for i in 0..20u64 {
            let offset = if i % 2 == 0 { 0 } else { 1 << 32 };
            seek.update(offset, 4096);
        }
        assert!(seek.is_seeky(512 * 1024));
    }

    #[test]
    fn test_seeky_requires_valid_samples() {
        let mut seek = SeekStats::default();
        seek.update(0, 4096);
        seek.update(1 << 32, 4096);
        assert!(seek.avg() > 512 * 1024);
        assert!(!seek.is_seeky(512 * 1024));
    }

    #[test]
    fn test_think_time_tracks_submission_gaps() {
        let mut ttime = ThinkTimeStats::default();
        let mut now = 0;
        for _ in 0..50 {
            ttime.update(now, 0, 0);
            now += 20_000;
        }
        let avg = ttime.avg_us();
        assert!((20_000..=21_000).contains(&avg), "avg={}", avg);
    }

    #[test]
    fn test_think_time_skips_completion_before_activation() {
        let mut ttime = ThinkTimeStats::default();
        ttime.update(0, 0, 0);
        ttime.update(10_000, 5, 100);
        assert_eq!(ttime.samples(), 1);
    }

    #[test]
    fn test_slow_thinker_needs_service_fraction() {
        let mut ttime = ThinkTimeStats::default();
        let mut now = 0;
        for _ in 0..10 {
            ttime.update(now, 0, 0);
            now += 50_000;
        }
        assert!(ttime.is_slow_thinker(9_000, 4096, 16384));
        assert!(!ttime.is_slow_thinker(9_000, 1024, 16384));
        assert!(!ttime.is_slow_thinker(100_000, 4096, 16384));
    }

    #[test]
    fn test_peak_rate_discards_absurd_intervals() {
        let mut peak = PeakRate::default();
        assert_eq!(peak.sample(1 << 20, 1_000, 100_000), None);
        assert_eq!(peak.sample(1 << 20, 200_000, 100_000), None);
        assert_eq!(peak.samples(), 0);
        assert_eq!(peak.rate(), 0);
    }

    #[test]
    fn test_peak_rate_ewma_and_budget() {
        let mut peak = PeakRate::default();
        // 100 bytes/us
        let mut budget = None;
        for _ in 0..200 {
            budget = peak.sample(1_000_000, 10_000, 100_000).or(budget);
        }
        assert_eq!(peak.samples(), VALID_MIN_SAMPLES);
        let rate = peak.rate() >> FIXPOINT_SHIFT;
        assert!((95..=100).contains(&rate), "rate={}", rate);
        let budget = budget.unwrap();
        assert!((9_500_000..=10_000_000).contains(&budget), "budget={}", budget);
    }

    #[test]
    fn test_is_slow() {
        // Too short to judge.
        assert!(!is_slow(0, 10_000, 16384, 100_000));
        // 1 byte/us over a 100ms slice = 100_000 bytes expected, budget 16 KiB.
        assert!(!is_slow(30_000, 30_000, 16384, 100_000));
        // 4 KiB in 50ms projects to ~8 KiB per slice, below 2/3 of 16 KiB.
        assert!(is_slow(4096, 50_000, 16384, 100_000));
    }
}
