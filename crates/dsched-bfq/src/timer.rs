//! One-shot timers for anticipatory waits.
//!
//! Cancellation is best effort: a callback that is already running, or that a
//! runtime has already committed to running, may still fire after
//! [`AsTimer::cancel`]. The scheduler tags every arm with a generation token
//! and ignores fires whose token is no longer current.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Work to run when a timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// A single re-armable one-shot timer.
pub trait AsTimer: Send + Sync {
    /// Arms the timer, replacing any pending callback.
    fn arm(&self, delay: Duration, callback: TimerCallback);

    /// Cancels the pending callback. Returns true if one was pending.
    fn cancel(&self) -> bool;
}

/// Timer backed by a tokio sleep task.
#[derive(Debug)]
pub struct TokioAsTimer {
    handle: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TokioAsTimer {
    /// Creates a timer that spawns onto the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            pending: Mutex::new(None),
        }
    }

    /// Creates a timer on the runtime of the calling context, if any.
    pub fn from_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl AsTimer for TokioAsTimer {
    fn arm(&self, delay: Duration, callback: TimerCallback) {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        if let Some(old) = self.pending.lock().replace(task) {
            old.abort();
        }
        trace!(?delay, "AS timer armed");
    }

    fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(task) => {
                let was_pending = !task.is_finished();
                task.abort();
                was_pending
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct ManualState {
    pending: Option<(Duration, TimerCallback)>,
    cancelled: Vec<TimerCallback>,
    arms: u64,
    cancels: u64,
    last_delay: Option<Duration>,
}

/// Timer fired explicitly by the caller.
///
/// Cancelled callbacks are retained so that a late fire racing a cancel can
/// be replayed with [`fire_cancelled`](Self::fire_cancelled).
#[derive(Default)]
pub struct ManualAsTimer {
    state: Mutex<ManualState>,
}

impl ManualAsTimer {
    /// Creates an idle timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the pending callback. Returns false if nothing was armed.
    pub fn fire(&self) -> bool {
        let pending = self.state.lock().pending.take();
        match pending {
            Some((_, callback)) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Runs the most recently cancelled callback, as a late fire would.
    pub fn fire_cancelled(&self) -> bool {
        let stale = self.state.lock().cancelled.pop();
        match stale {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Whether a callback is armed.
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Delay of the armed callback, if any.
    pub fn pending_delay(&self) -> Option<Duration> {
        self.state.lock().pending.as_ref().map(|(d, _)| *d)
    }

    /// Delay passed to the most recent arm.
    pub fn last_delay(&self) -> Option<Duration> {
        self.state.lock().last_delay
    }

    /// Number of arms so far.
    pub fn arm_count(&self) -> u64 {
        self.state.lock().arms
    }

    /// Number of cancels that stopped a pending callback.
    pub fn cancel_count(&self) -> u64 {
        self.state.lock().cancels
    }
}

impl AsTimer for ManualAsTimer {
    fn arm(&self, delay: Duration, callback: TimerCallback) {
        let mut st = self.state.lock();
        st.arms += 1;
        st.last_delay = Some(delay);
        st.pending = Some((delay, callback));
    }

    fn cancel(&self) -> bool {
        let mut st = self.state.lock();
        match st.pending.take() {
            Some((_, callback)) => {
                st.cancels += 1;
                st.cancelled.push(callback);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ManualAsTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ManualAsTimer")
            .field("pending", &st.pending.as_ref().map(|(d, _)| *d))
            .field("arms", &st.arms)
            .field("cancels", &st.cancels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicU32>) -> TimerCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_fire_runs_callback_once() {
        let timer = ManualAsTimer::new();
        let fired = Arc::new(AtomicU32::new(0));
        timer.arm(Duration::from_millis(9), counting_callback(&fired));

        assert!(timer.is_pending());
        assert_eq!(timer.pending_delay(), Some(Duration::from_millis(9)));
        assert!(timer.fire());
        assert!(!timer.fire());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_cancel_retains_stale_callback() {
        let timer = ManualAsTimer::new();
        let fired = Arc::new(AtomicU32::new(0));
        timer.arm(Duration::from_millis(1), counting_callback(&fired));

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.is_pending());
        assert_eq!(timer.cancel_count(), 1);
        assert!(!timer.fire());

        assert!(timer.fire_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_rearm_replaces_pending() {
        let timer = ManualAsTimer::new();
        let fired = Arc::new(AtomicU32::new(0));
        timer.arm(Duration::from_millis(9), counting_callback(&fired));
        timer.arm(Duration::from_millis(1), counting_callback(&fired));

        assert_eq!(timer.arm_count(), 2);
        assert_eq!(timer.last_delay(), Some(Duration::from_millis(1)));
        assert!(timer.fire());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tokio_timer_fires() {
        let timer = TokioAsTimer::from_current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        timer.arm(
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("timer did not fire")
            .unwrap();
    }

    #[tokio::test]
    async fn test_tokio_timer_cancel() {
        let timer = TokioAsTimer::from_current().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        timer.arm(Duration::from_millis(50), counting_callback(&fired));
        assert!(timer.cancel());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.cancel());
    }

    #[test]
    fn test_from_current_outside_runtime() {
        assert!(TokioAsTimer::from_current().is_none());
    }
}
