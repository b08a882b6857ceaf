//! BFQ device scheduler.
//!
//! One [`BfqScheduler`] exists per block device. It serves one submitter at a
//! time (the *active* submitter) until that submitter exhausts its budget,
//! overruns the slice timeout, or runs dry; the next submitter is then taken
//! from the WF2Q+ tree. When the active submitter runs dry the device may idle
//! briefly in anticipation of its next request.
//!
//! Locking: the device lock guards the tree, the active and blocked-on
//! references, the remaining budget and the timer generation. Each submitter
//! has its own lock for its queue and heuristics. When both are needed the
//! device lock is taken first; `enqueue` releases the submitter lock before
//! touching the device lock. The driver is only ever called with no scheduler
//! lock held.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::bio::{Bio, BioKind};
use crate::budget::{BudgetLimits, ExpireReason};
use crate::clock::Clock;
use crate::config::BfqConfig;
use crate::driver::DiskDriver;
use crate::error::{BfqError, BfqResult};
use crate::heuristics::{is_slow, PeakRate};
use crate::policy::{DiskSchedPolicy, EnqueueStatus};
use crate::stats::{AtomicCounters, BfqStats, DeviceCounters};
use crate::tdio::{SubmitterId, TdioState, ThreadIo};
use crate::timer::AsTimer;
use crate::wf2q::Wf2qTree;

/// `active_id` value meaning no submitter is active.
const NO_ACTIVE: u64 = u64::MAX;

/// State guarded by the device lock.
struct DeviceState {
    prepared: bool,
    tree: Wf2qTree<Arc<ThreadIo>>,
    active: Option<Arc<ThreadIo>>,
    blocked_on: Option<Arc<ThreadIo>>,
    remaining_budget: u64,
    max_budget: u64,
    peak: PeakRate,
    as_enabled: bool,
    auto_max_budget: bool,
    timer_generation: u64,
    pass_running: bool,
    pass_requested: bool,
    counters: DeviceCounters,
}

impl DeviceState {
    fn new(config: &BfqConfig) -> Self {
        Self {
            prepared: false,
            tree: Wf2qTree::new(),
            active: None,
            blocked_on: None,
            remaining_budget: 0,
            max_budget: config.max_budget,
            peak: PeakRate::default(),
            as_enabled: config.as_enabled,
            auto_max_budget: config.auto_max_budget,
            timer_generation: 0,
            pass_running: false,
            pass_requested: false,
            counters: DeviceCounters::default(),
        }
    }

    fn is_active(&self, tdio: &Arc<ThreadIo>) -> bool {
        self.active.as_ref().is_some_and(|a| Arc::ptr_eq(a, tdio))
    }

    fn is_blocked_on(&self, tdio: &Arc<ThreadIo>) -> bool {
        self.blocked_on.as_ref().is_some_and(|b| Arc::ptr_eq(b, tdio))
    }
}

/// Budget Fair Queueing scheduler for one device.
pub struct BfqScheduler {
    config: BfqConfig,
    device: Mutex<DeviceState>,
    driver: Arc<dyn DiskDriver>,
    timer: Arc<dyn AsTimer>,
    clock: Arc<dyn Clock>,
    self_ref: Weak<BfqScheduler>,
    active_id: AtomicU64,
    accepting: AtomicBool,
    counters: AtomicCounters,
}

impl BfqScheduler {
    /// Creates a scheduler. It accepts requests once [`prepare`] is called.
    ///
    /// [`prepare`]: DiskSchedPolicy::prepare
    pub fn new(
        config: BfqConfig,
        driver: Arc<dyn DiskDriver>,
        timer: Arc<dyn AsTimer>,
        clock: Arc<dyn Clock>,
    ) -> BfqResult<Arc<Self>> {
        config.validate()?;
        debug!(
            "Creating BfqScheduler: min_budget={}, max_budget={}, slice_timeout_ms={}, as_enabled={}",
            config.min_budget, config.max_budget, config.slice_timeout_ms, config.as_enabled
        );
        Ok(Arc::new_cyclic(|self_ref| Self {
            device: Mutex::new(DeviceState::new(&config)),
            config,
            driver,
            timer,
            clock,
            self_ref: self_ref.clone(),
            active_id: AtomicU64::new(NO_ACTIVE),
            accepting: AtomicBool::new(false),
            counters: AtomicCounters::default(),
        }))
    }

    /// Returns the configuration the scheduler was built with.
    #[inline]
    pub fn config(&self) -> &BfqConfig {
        &self.config
    }

    /// Creates a submitter context with an explicit weight.
    pub fn new_submitter_with_weight(&self, weight: u32) -> Arc<ThreadIo> {
        let id = SubmitterId::next();
        let weight = if weight == 0 {
            self.config.default_weight
        } else {
            weight
        };
        debug!("{} created, budget={}, weight={}", id, self.config.min_budget, weight);
        Arc::new(ThreadIo::new(id, self.config.min_budget, weight))
    }

    /// Turns anticipatory idling on or off for this device.
    pub fn set_as_enabled(&self, enabled: bool) {
        self.device.lock().as_enabled = enabled;
        info!("BFQ anticipation {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Turns max-budget auto-tuning on or off for this device.
    pub fn set_auto_max_budget(&self, enabled: bool) {
        self.device.lock().auto_max_budget = enabled;
        info!(
            "BFQ max budget auto-tuning {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// ID of the active submitter.
    pub fn active_submitter(&self) -> Option<SubmitterId> {
        self.device.lock().active.as_ref().map(|t| t.id())
    }

    /// ID of the submitter the device is idling for.
    pub fn blocked_on(&self) -> Option<SubmitterId> {
        self.device.lock().blocked_on.as_ref().map(|t| t.id())
    }

    /// IDs of ready submitters in selection order.
    pub fn ready_submitters(&self) -> Vec<SubmitterId> {
        self.device.lock().tree.ids()
    }

    /// Whether the submitter is waiting in the WF2Q tree.
    pub fn is_ready(&self, id: SubmitterId) -> bool {
        self.device.lock().tree.contains(id)
    }

    /// Budget left to the active submitter in this activation.
    pub fn remaining_budget(&self) -> u64 {
        self.device.lock().remaining_budget
    }

    /// Current max budget.
    pub fn max_budget(&self) -> u64 {
        self.device.lock().max_budget
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> BfqStats {
        let dev = self.device.lock();
        let c = &dev.counters;
        let mut stats = BfqStats {
            rejected: c.rejected,
            cancelled: c.cancelled,
            expired_timeout: c.expired_timeout,
            expired_too_idle: c.expired_too_idle,
            expired_out_of_budget: c.expired_out_of_budget,
            budget_underflows: c.budget_underflows,
            as_armed: c.as_armed,
            as_hits: c.as_hits,
            as_misses: c.as_misses,
            as_fake_timeouts: c.as_fake_timeouts,
            as_destroyed: c.as_destroyed,
            as_avg_wait_all_us: c.as_wait.avg_all_us,
            as_avg_wait_miss_us: c.as_wait.avg_miss_us,
            as_max_wait_us: c.as_wait.max_us,
            as_high_wait_count: c.as_wait.high_count,
            peak_rate: dev.peak.rate(),
            peak_rate_samples: dev.peak.samples(),
            max_budget: dev.max_budget,
            ready_submitters: dev.tree.len(),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    fn set_active(&self, dev: &mut DeviceState, tdio: Option<Arc<ThreadIo>>) {
        let id = tdio.as_ref().map_or(NO_ACTIVE, |t| t.id().0);
        dev.active = tdio;
        self.active_id.store(id, Ordering::Release);
    }

    /// Invalidates any armed anticipation timer.
    fn disarm(&self, dev: &mut DeviceState) -> bool {
        dev.timer_generation += 1;
        self.timer.cancel()
    }

    fn record_as_wait(&self, dev: &mut DeviceState, st: &TdioState, missed: bool) {
        let wait_us = self.clock.now_us().saturating_sub(st.as_start_us);
        let high_us = 5 * self.config.as_wait_seeky_us;
        dev.counters.as_wait.record(wait_us, missed, high_us);
    }

    fn update_peak_rate(&self, dev: &mut DeviceState, tdio: &ThreadIo) {
        let elapsed = tdio.last_done_us().saturating_sub(tdio.service_start_us());
        let sampled = dev.peak.sample(
            tdio.service_received(),
            elapsed,
            self.config.slice_timeout_us(),
        );
        if let Some(max_budget) = sampled {
            if dev.auto_max_budget {
                dev.max_budget = max_budget.max(self.config.min_budget);
                debug!("max budget updated to {}", dev.max_budget);
            }
        }
    }

    /// Ends the activation of `tdio`, assigns its next budget, and puts it
    /// back in the tree if it still has requests.
    ///
    /// Called with both the device lock and `tdio`'s lock held.
    fn expire(
        &self,
        dev: &mut DeviceState,
        tdio: &Arc<ThreadIo>,
        st: &mut TdioState,
        reason: ExpireReason,
    ) {
        let weight = u64::from(st.weight);
        let consumed = st.budget.saturating_sub(dev.remaining_budget);
        st.vstart = st.vstart.saturating_add(consumed / weight);

        let service = tdio.service_received();
        let budget_left = match st.budget.checked_sub(service) {
            Some(left) => left,
            None => {
                warn!(
                    "{} budget underflow: budget={}, service_received={}",
                    tdio.id(),
                    st.budget,
                    service
                );
                dev.counters.budget_underflows += 1;
                0
            }
        };

        let good_locality = st.seek.is_valid() && !st.seek.is_seeky(self.config.seeky_threshold);
        match reason {
            ExpireReason::Timeout | ExpireReason::OutOfBudget if good_locality => {
                self.update_peak_rate(dev, tdio);
            }
            ExpireReason::TooIdle => {
                let elapsed = tdio.last_done_us().saturating_sub(tdio.service_start_us());
                if is_slow(service, elapsed, st.budget, self.config.slice_timeout_us()) {
                    debug!("{} judged slow, charged unused budget {}", tdio.id(), budget_left);
                    st.vstart = st.vstart.saturating_add(budget_left / weight);
                }
            }
            _ => {}
        }

        let limits = BudgetLimits::from_config(&self.config, dev.max_budget);
        let old_budget = st.budget;
        st.budget = limits.next_budget(reason, st.budget, service, tdio.in_flight());
        dev.counters.record_expire(reason);
        debug!(
            "{} expired ({}): consumed={}, service={}, budget {} -> {}",
            tdio.id(),
            reason,
            consumed,
            service,
            old_budget,
            st.budget
        );

        tdio.clear_maybe_timeout();
        dev.remaining_budget = 0;
        self.set_active(dev, None);

        if !st.queue.is_empty() && !dev.tree.contains(tdio.id()) {
            if let Some(start) =
                dev.tree
                    .insert(tdio.id(), st.vstart, st.budget, st.weight, Arc::clone(tdio))
            {
                st.vstart = start;
            }
        }
    }

    /// Makes the next ready submitter active. Returns false if none is ready.
    fn select_next(&self, dev: &mut DeviceState) -> bool {
        let Some(selected) = dev.tree.pop_next() else {
            trace!("no ready submitter");
            return false;
        };
        let tdio = selected.item;
        let st = tdio.state.lock();
        let activation = tdio.begin_activation(self.clock.now_us());
        dev.remaining_budget = st.budget;
        debug!(
            "{} selected: activation={}, budget={}, queue_len={}, vfinish={}",
            tdio.id(),
            activation,
            st.budget,
            st.queue.len(),
            selected.finish
        );
        drop(st);
        self.set_active(dev, Some(tdio));
        true
    }

    /// The locked half of a dispatch pass: picks up to the free slot count of
    /// requests into `batch`.
    fn dispatch_locked(&self, dev: &mut DeviceState, batch: &mut Vec<Bio>) {
        if !dev.prepared || dev.blocked_on.is_some() {
            return;
        }

        let mut free_slots = self
            .driver
            .max_slots()
            .saturating_sub(self.driver.slots_in_use())
            .min(self.config.max_dispatch_batch);

        while free_slots > 0 {
            let Some(active) = dev.active.clone() else {
                if self.select_next(dev) {
                    continue;
                }
                break;
            };
            let mut st = active.state.lock();

            if active.maybe_timeout() {
                debug!("{} timed out in dispatch", active.id());
                self.expire(dev, &active, &mut st, ExpireReason::Timeout);
                continue;
            }

            let Some(head) = st.queue.front() else {
                if dev.remaining_budget == 0 || !dev.as_enabled || !st.as_eligible {
                    // Shrink to what this activation used before growing.
                    st.budget = st.budget.saturating_sub(dev.remaining_budget);
                    dev.remaining_budget = 0;
                    self.expire(dev, &active, &mut st, ExpireReason::OutOfBudget);
                    continue;
                }
                self.arm_anticipation(dev, &active, &mut st);
                return;
            };

            if !head.kind.is_read_write() {
                if let Some(bio) = st.queue.pop_front() {
                    trace!("{} passing {} request {:?} through", active.id(), bio.kind, bio.id);
                    active.note_dispatched();
                    batch.push(bio);
                    free_slots -= 1;
                }
                continue;
            }

            if head.size > dev.remaining_budget && dev.remaining_budget != st.budget {
                debug!(
                    "{} out of budget: head size {} > remaining {}",
                    active.id(),
                    head.size,
                    dev.remaining_budget
                );
                self.expire(dev, &active, &mut st, ExpireReason::OutOfBudget);
                continue;
            }

            let Some(mut bio) = st.queue.pop_front() else {
                continue;
            };
            match dev.remaining_budget.checked_sub(bio.size) {
                Some(left) => dev.remaining_budget = left,
                None => {
                    // Only the first request of an activation may overdraw.
                    let overdraft = bio.size - dev.remaining_budget;
                    st.vstart = st.vstart.saturating_add(overdraft / u64::from(st.weight));
                    dev.remaining_budget = 0;
                    debug!("{} overdrew its budget by {}", active.id(), overdraft);
                }
            }
            bio.set_activation(active.current_activation());
            active.note_dispatched();
            dev.tree.add_service(bio.size);
            trace!(
                "{} dispatching {:?}: size={}, remaining_budget={}",
                active.id(),
                bio.id,
                bio.size,
                dev.remaining_budget
            );
            batch.push(bio);
            free_slots -= 1;
        }
    }

    fn arm_anticipation(&self, dev: &mut DeviceState, tdio: &Arc<ThreadIo>, st: &mut TdioState) {
        let seeky = st.seek.is_seeky(self.config.seeky_threshold);
        let delay = self.config.as_wait(seeky);

        dev.timer_generation += 1;
        let generation = dev.timer_generation;
        dev.blocked_on = Some(Arc::clone(tdio));
        dev.counters.as_armed += 1;
        st.as_start_us = self.clock.now_us();

        let scheduler = self.self_ref.clone();
        self.timer.arm(
            delay,
            Box::new(move || {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.handle_as_timeout(generation);
                }
            }),
        );
        debug!(
            "blocked on {}: wait={:?}, seeky={}, remaining_budget={}",
            tdio.id(),
            delay,
            seeky,
            dev.remaining_budget
        );
    }

    /// Timer callback for the anticipation wait armed with `generation`.
    fn handle_as_timeout(&self, generation: u64) {
        {
            let mut dev = self.device.lock();
            if dev.timer_generation != generation || dev.blocked_on.is_none() {
                dev.counters.as_fake_timeouts += 1;
                debug!("fake AS timeout (generation {})", generation);
                return;
            }
            let Some(tdio) = dev.blocked_on.take() else {
                return;
            };
            dev.counters.as_misses += 1;

            let mut st = tdio.state.lock();
            self.record_as_wait(&mut dev, &st, true);
            debug!("unblocked {}", tdio.id());

            let reason = if tdio.maybe_timeout() {
                ExpireReason::Timeout
            } else {
                ExpireReason::TooIdle
            };
            self.expire(&mut dev, &tdio, &mut st, reason);
        }
        self.run_dispatch();
    }

    /// Runs dispatch passes until no further pass has been requested.
    ///
    /// Concurrent callers coalesce: if a pass is already running, the call
    /// only asks it to go round once more.
    fn run_dispatch(&self) {
        let mut dev = self.device.lock();
        if dev.pass_running {
            dev.pass_requested = true;
            return;
        }
        dev.pass_running = true;

        let mut batch = Vec::with_capacity(self.config.max_dispatch_batch);
        loop {
            dev.pass_requested = false;
            self.dispatch_locked(&mut dev, &mut batch);
            drop(dev);

            let count = batch.len() as u64;
            for bio in batch.drain(..) {
                self.driver.dispatch(bio);
            }
            self.counters
                .dispatched
                .fetch_add(count, Ordering::Relaxed);

            dev = self.device.lock();
            if !dev.pass_requested {
                dev.pass_running = false;
                return;
            }
        }
    }

    /// Removes every queued request. Caller hands them to the driver.
    fn drain_queues(&self, dev: &mut DeviceState) -> Vec<Bio> {
        let mut drained = Vec::new();
        if dev.blocked_on.take().is_some() {
            self.disarm(dev);
        }
        let mut owners: Vec<Arc<ThreadIo>> = dev.active.iter().cloned().collect();
        while let Some(selected) = dev.tree.pop_next() {
            owners.push(selected.item);
        }
        self.set_active(dev, None);
        dev.remaining_budget = 0;

        for tdio in owners {
            let mut st = tdio.state.lock();
            drained.extend(st.queue.drain(..));
        }
        dev.counters.cancelled += drained.len() as u64;
        drained
    }
}

impl DiskSchedPolicy for BfqScheduler {
    fn name(&self) -> &'static str {
        "bfq"
    }

    fn prepare(&self) -> BfqResult<()> {
        let mut dev = self.device.lock();
        if dev.prepared {
            return Err(BfqError::AlreadyPrepared);
        }
        // Timer generations never repeat, a pass still running from before
        // teardown keeps its flags, and counters are cumulative.
        let fresh = DeviceState {
            prepared: true,
            timer_generation: dev.timer_generation + 1,
            pass_running: dev.pass_running,
            pass_requested: dev.pass_requested,
            counters: std::mem::take(&mut dev.counters),
            ..DeviceState::new(&self.config)
        };
        *dev = fresh;
        self.active_id.store(NO_ACTIVE, Ordering::Release);
        self.accepting.store(true, Ordering::Release);
        info!("BFQ: initialized");
        Ok(())
    }

    fn teardown(&self) -> BfqResult<()> {
        if !self.device.lock().prepared {
            return Err(BfqError::NotPrepared);
        }
        self.accepting.store(false, Ordering::Release);
        self.cancel_all();
        let mut dev = self.device.lock();
        self.disarm(&mut dev);
        dev.prepared = false;
        info!("BFQ: torn down");
        Ok(())
    }

    fn cancel_all(&self) {
        let drained = {
            let mut dev = self.device.lock();
            self.drain_queues(&mut dev)
        };
        if !drained.is_empty() {
            info!("BFQ: cancelling {} queued requests", drained.len());
        }
        for mut bio in drained {
            bio.detach();
            self.driver.cancel(bio);
        }
    }

    fn enqueue(&self, tdio: &Arc<ThreadIo>, mut bio: Bio) -> EnqueueStatus {
        if bio.kind == BioKind::Flush || !self.accepting.load(Ordering::Acquire) {
            debug!("{} {} request {:?} rejected", tdio.id(), bio.kind, bio.id);
            self.device.lock().counters.rejected += 1;
            return EnqueueStatus::Rejected(bio);
        }

        let now = self.clock.now_us();
        bio.attach(Arc::clone(tdio));
        trace!("{} pushes {:?}", tdio.id(), bio);

        let was_empty = {
            let mut st = tdio.state.lock();
            if bio.kind.is_read_write() {
                st.seek.update(bio.offset, bio.size);
            }
            st.ttime
                .update(now, tdio.last_done_us(), tdio.service_start_us());

            if st.seek.is_seeky(self.config.seeky_threshold) {
                trace!("{} is seeky, seek_avg={}", tdio.id(), st.seek.avg());
            }
            let slow_thinker = st.ttime.is_slow_thinker(
                self.config.as_wait_us,
                tdio.service_received(),
                st.budget,
            );
            if slow_thinker && st.as_eligible {
                debug!("{} takes too long to think, AS off", tdio.id());
            }
            st.as_eligible = !slow_thinker;

            st.queue.push_back(bio);
            st.queue.len() == 1
        };
        AtomicCounters::bump(&self.counters.enqueued);

        if was_empty {
            let mut dev = self.device.lock();
            if dev.is_active(tdio) {
                if dev.is_blocked_on(tdio) {
                    dev.counters.as_hits += 1;
                    self.disarm(&mut dev);
                    dev.blocked_on = None;
                    let st = tdio.state.lock();
                    self.record_as_wait(&mut dev, &st, false);
                    debug!("{} pushed a new request during AS", tdio.id());
                }
            } else if !dev.tree.contains(tdio.id()) {
                let mut st = tdio.state.lock();
                if !st.queue.is_empty() {
                    if let Some(start) =
                        dev.tree
                            .insert(tdio.id(), st.vstart, st.budget, st.weight, Arc::clone(tdio))
                    {
                        st.vstart = start;
                    }
                }
            }
        }

        self.run_dispatch();
        EnqueueStatus::Queued
    }

    fn new_submitter(&self) -> Arc<ThreadIo> {
        self.new_submitter_with_weight(self.config.default_weight)
    }

    fn destroy_submitter(&self, tdio: &Arc<ThreadIo>) {
        tdio.mark_destroyed();
        {
            let st = tdio.state.lock();
            if st.seek.samples() != 0 || st.ttime.samples() != 0 {
                debug!(
                    "{} destroyed: seek_avg={}, think_avg_us={}",
                    tdio.id(),
                    st.seek.avg(),
                    st.ttime.avg_us()
                );
            }
        }

        {
            let mut dev = self.device.lock();
            if !dev.is_blocked_on(tdio) {
                return;
            }
            info!("BFQ: pending on {} which is being destroyed", tdio.id());
            self.disarm(&mut dev);
            dev.blocked_on = None;
            dev.counters.as_destroyed += 1;
            self.set_active(&mut dev, None);
            dev.remaining_budget = 0;

            let mut st = tdio.state.lock();
            if !st.queue.is_empty() && !dev.tree.contains(tdio.id()) {
                if let Some(start) =
                    dev.tree
                        .insert(tdio.id(), st.vstart, st.budget, st.weight, Arc::clone(tdio))
                {
                    st.vstart = start;
                }
            }
        }
        self.run_dispatch();
    }

    fn on_completion(&self, bio: &mut Bio) {
        let Some(tdio) = bio.detach() else {
            return;
        };
        tdio.note_completed();
        AtomicCounters::bump(&self.counters.completed);

        if self.active_id.load(Ordering::Acquire) != tdio.id().0 {
            return;
        }
        if bio.activation() != tdio.current_activation() {
            return;
        }

        let now = self.clock.now_us();
        tdio.credit_service(bio.size, now);

        let slice_us = now.saturating_sub(tdio.service_start_us());
        let slice_timeout_us = self.config.slice_timeout_us();
        if slice_us >= slice_timeout_us && tdio.raise_maybe_timeout() {
            self.counters.record_time_slice(slice_us, slice_timeout_us);
            debug!("{} may time out after {}us", tdio.id(), slice_us);
        }
    }

    fn poll(&self) {
        self.run_dispatch();
    }
}

impl std::fmt::Debug for BfqScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BfqScheduler")
            .field("config", &self.config)
            .field("active_id", &self.active_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
