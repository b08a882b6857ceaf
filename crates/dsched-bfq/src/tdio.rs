//! Per-submitter scheduling context.
//!
//! A [`ThreadIo`] exists for every thread or process issuing I/O to a device.
//! Its queue and heuristics live behind its own lock; the counters touched by
//! the completion path are atomics so that completions never block.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bio::Bio;
use crate::heuristics::{SeekStats, ThinkTimeStats};

/// Identifier of a submitter context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubmitterId(pub u64);

/// Submitter IDs are unique within the process, across devices.
static NEXT_SUBMITTER_ID: AtomicU64 = AtomicU64::new(1);

impl SubmitterId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBMITTER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tdio#{}", self.0)
    }
}

/// State guarded by the submitter lock.
#[derive(Debug)]
pub(crate) struct TdioState {
    pub(crate) queue: VecDeque<Bio>,
    pub(crate) budget: u64,
    pub(crate) weight: u32,
    pub(crate) vstart: u64,
    pub(crate) seek: SeekStats,
    pub(crate) ttime: ThinkTimeStats,
    pub(crate) as_eligible: bool,
    pub(crate) as_start_us: u64,
}

/// Scheduling context of one submitter on one device.
pub struct ThreadIo {
    id: SubmitterId,
    pub(crate) state: Mutex<TdioState>,
    maybe_timeout: AtomicBool,
    destroyed: AtomicBool,
    activation: AtomicU64,
    service_received: AtomicU64,
    service_start_us: AtomicU64,
    last_done_us: AtomicU64,
    bio_dispatched: AtomicU64,
    bio_completed: AtomicU64,
}

/// Point-in-time view of a submitter, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TdioSnapshot {
    /// Submitter ID.
    pub id: SubmitterId,
    /// Requests waiting in its queue.
    pub queue_len: usize,
    /// Current budget in bytes.
    pub budget: u64,
    /// Scheduling weight.
    pub weight: u32,
    /// Virtual start time.
    pub vstart: u64,
    /// Average seek distance in bytes.
    pub seek_avg: u64,
    /// Weighted seek sample count.
    pub seek_samples: u64,
    /// Average think time in microseconds.
    pub think_avg_us: u64,
    /// Weighted think-time sample count.
    pub think_samples: u64,
    /// Whether anticipation may wait for this submitter.
    pub as_eligible: bool,
    /// Service credited during the current activation.
    pub service_received: u64,
    /// Requests handed to the driver.
    pub dispatched: u64,
    /// Requests completed by the driver.
    pub completed: u64,
}

impl ThreadIo {
    /// Creates a context with the given starting budget and weight.
    pub(crate) fn new(id: SubmitterId, budget: u64, weight: u32) -> Self {
        Self {
            id,
            state: Mutex::new(TdioState {
                queue: VecDeque::new(),
                budget,
                weight: weight.max(1),
                vstart: 0,
                seek: SeekStats::default(),
                ttime: ThinkTimeStats::default(),
                as_eligible: true,
                as_start_us: 0,
            }),
            maybe_timeout: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            activation: AtomicU64::new(0),
            service_received: AtomicU64::new(0),
            service_start_us: AtomicU64::new(0),
            last_done_us: AtomicU64::new(0),
            bio_dispatched: AtomicU64::new(0),
            bio_completed: AtomicU64::new(0),
        }
    }

    /// Submitter ID.
    #[inline]
    pub fn id(&self) -> SubmitterId {
        self.id
    }

    /// Number of requests waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Current budget in bytes.
    pub fn budget(&self) -> u64 {
        self.state.lock().budget
    }

    /// Scheduling weight.
    pub fn weight(&self) -> u32 {
        self.state.lock().weight
    }

    /// Changes the scheduling weight. Takes effect at the next tree insertion.
    pub fn set_weight(&self, weight: u32) {
        self.state.lock().weight = weight.max(1);
    }

    /// Service credited by completions during the current activation.
    #[inline]
    pub fn service_received(&self) -> u64 {
        self.service_received.load(Ordering::Acquire)
    }

    /// Requests handed to the driver so far.
    #[inline]
    pub fn dispatched(&self) -> u64 {
        self.bio_dispatched.load(Ordering::Acquire)
    }

    /// Requests completed so far.
    #[inline]
    pub fn completed(&self) -> u64 {
        self.bio_completed.load(Ordering::Acquire)
    }

    /// Requests dispatched but not yet completed.
    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.dispatched().saturating_sub(self.completed())
    }

    /// Whether a completion has observed the slice running out.
    #[inline]
    pub fn maybe_timeout(&self) -> bool {
        self.maybe_timeout.load(Ordering::Acquire)
    }

    /// Whether the owner has torn this context down.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Returns a diagnostic snapshot.
    pub fn snapshot(&self) -> TdioSnapshot {
        let st = self.state.lock();
        TdioSnapshot {
            id: self.id,
            queue_len: st.queue.len(),
            budget: st.budget,
            weight: st.weight,
            vstart: st.vstart,
            seek_avg: st.seek.avg(),
            seek_samples: st.seek.samples(),
            think_avg_us: st.ttime.avg_us(),
            think_samples: st.ttime.samples(),
            as_eligible: st.as_eligible,
            service_received: self.service_received(),
            dispatched: self.dispatched(),
            completed: self.completed(),
        }
    }

    pub(crate) fn current_activation(&self) -> u64 {
        self.activation.load(Ordering::Acquire)
    }

    /// Starts a new activation and returns its number.
    pub(crate) fn begin_activation(&self, now_us: u64) -> u64 {
        self.service_received.store(0, Ordering::Release);
        self.service_start_us.store(now_us, Ordering::Release);
        self.maybe_timeout.store(false, Ordering::Release);
        self.activation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn service_start_us(&self) -> u64 {
        self.service_start_us.load(Ordering::Acquire)
    }

    pub(crate) fn last_done_us(&self) -> u64 {
        self.last_done_us.load(Ordering::Acquire)
    }

    pub(crate) fn clear_maybe_timeout(&self) {
        self.maybe_timeout.store(false, Ordering::Release);
    }

    /// Raises the slice-timeout flag; true only for the caller that set it.
    pub(crate) fn raise_maybe_timeout(&self) -> bool {
        self.maybe_timeout
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub(crate) fn note_dispatched(&self) {
        self.bio_dispatched.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_completed(&self) {
        self.bio_completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn credit_service(&self, bytes: u64, now_us: u64) {
        self.service_received.fetch_add(bytes, Ordering::AcqRel);
        self.last_done_us.store(now_us, Ordering::Release);
    }
}

impl fmt::Debug for ThreadIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadIo")
            .field("id", &self.id)
            .field("dispatched", &self.dispatched())
            .field("completed", &self.completed())
            .field("maybe_timeout", &self.maybe_timeout())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{BioId, BioKind};

    #[test]
    fn test_new_context_defaults() {
        let tdio = ThreadIo::new(SubmitterId(1), 16384, 1);
        assert_eq!(tdio.id(), SubmitterId(1));
        assert_eq!(tdio.queue_len(), 0);
        assert_eq!(tdio.budget(), 16384);
        assert_eq!(tdio.weight(), 1);
        assert_eq!(tdio.in_flight(), 0);
        assert!(!tdio.maybe_timeout());
        assert!(!tdio.is_destroyed());
        assert!(tdio.snapshot().as_eligible);
    }

    #[test]
    fn test_zero_weight_clamped() {
        let tdio = ThreadIo::new(SubmitterId(1), 16384, 0);
        assert_eq!(tdio.weight(), 1);
        tdio.set_weight(0);
        assert_eq!(tdio.weight(), 1);
        tdio.set_weight(4);
        assert_eq!(tdio.weight(), 4);
    }

    #[test]
    fn test_activation_resets_per_slice_state() {
        let tdio = ThreadIo::new(SubmitterId(1), 16384, 1);
        tdio.credit_service(4096, 10);
        assert!(tdio.raise_maybe_timeout());

        let act = tdio.begin_activation(100);
        assert_eq!(act, 1);
        assert_eq!(tdio.service_received(), 0);
        assert_eq!(tdio.service_start_us(), 100);
        assert!(!tdio.maybe_timeout());
        assert_eq!(tdio.begin_activation(200), 2);
        assert_eq!(tdio.current_activation(), 2);
    }

    #[test]
    fn test_maybe_timeout_raised_once() {
        let tdio = ThreadIo::new(SubmitterId(1), 16384, 1);
        assert!(tdio.raise_maybe_timeout());
        assert!(!tdio.raise_maybe_timeout());
        tdio.clear_maybe_timeout();
        assert!(tdio.raise_maybe_timeout());
    }

    #[test]
    fn test_in_flight_accounting() {
        let tdio = ThreadIo::new(SubmitterId(1), 16384, 1);
        tdio.note_dispatched();
        tdio.note_dispatched();
        tdio.note_completed();
        assert_eq!(tdio.in_flight(), 1);
    }

    #[test]
    fn test_snapshot_reflects_queue() {
        let tdio = ThreadIo::new(SubmitterId(9), 16384, 2);
        tdio.state
            .lock()
            .queue
            .push_back(Bio::new(BioId(1), BioKind::Read, 0, 4096));
        let snap = tdio.snapshot();
        assert_eq!(snap.queue_len, 1);
        assert_eq!(snap.weight, 2);
        assert_eq!(format!("{}", snap.id), "tdio#9");
    }
}
