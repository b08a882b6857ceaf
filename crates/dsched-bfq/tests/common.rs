//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use dsched_bfq::{
    BfqConfig, BfqScheduler, Bio, BioId, BioIdGen, BioKind, DiskSchedPolicy, ManualAsTimer,
    ManualClock, MockDisk, ThreadIo,
};

/// Start time of every fixture clock, in microseconds.
pub const START_US: u64 = 1_000_000;

/// A prepared scheduler over a mock disk, a manual timer and a manual clock.
pub struct Fixture {
    pub sched: Arc<BfqScheduler>,
    pub disk: Arc<MockDisk>,
    pub timer: Arc<ManualAsTimer>,
    pub clock: Arc<ManualClock>,
    ids: BioIdGen,
}

impl Fixture {
    pub fn new(config: BfqConfig, slots: usize) -> Self {
        let disk = Arc::new(MockDisk::new(slots));
        let timer = Arc::new(ManualAsTimer::new());
        let clock = Arc::new(ManualClock::new(START_US));
        let sched = BfqScheduler::new(config, disk.clone(), timer.clone(), clock.clone())
            .expect("valid config");
        sched.prepare().expect("first prepare");
        Self {
            sched,
            disk,
            timer,
            clock,
            ids: BioIdGen::new(),
        }
    }

    pub fn next_id(&self) -> BioId {
        self.ids.next_id()
    }

    /// Submits a request and asserts it was queued.
    pub fn submit(&self, tdio: &Arc<ThreadIo>, kind: BioKind, offset: u64, size: u64) -> BioId {
        let bio = Bio::new(self.ids.next_id(), kind, offset, size);
        let id = bio.id;
        assert!(self.sched.enqueue(tdio, bio).is_queued(), "{:?} rejected", id);
        id
    }

    pub fn read(&self, tdio: &Arc<ThreadIo>, offset: u64, size: u64) -> BioId {
        self.submit(tdio, BioKind::Read, offset, size)
    }

    /// Completes the oldest in-flight request and lets the scheduler refill.
    pub fn complete_one(&self) -> Option<BioId> {
        let mut bio = self.disk.take_completed()?;
        self.sched.on_completion(&mut bio);
        self.sched.poll();
        Some(bio.id)
    }

    /// Completes every in-flight request without polling.
    pub fn complete_all(&self) -> usize {
        let done = self.disk.take_all_completed();
        let n = done.len();
        for mut bio in done {
            self.sched.on_completion(&mut bio);
        }
        n
    }

    /// Request IDs in the order they reached the driver.
    pub fn dispatch_order(&self) -> Vec<BioId> {
        self.disk.dispatched().into_iter().map(|(id, _)| id).collect()
    }
}

pub fn no_anticipation() -> BfqConfig {
    BfqConfig {
        as_enabled: false,
        ..Default::default()
    }
}
