//! The interface a disk-scheduling policy presents to the block layer.

use std::sync::Arc;

use crate::bio::Bio;
use crate::error::BfqResult;
use crate::tdio::ThreadIo;

/// Outcome of handing a request to a policy.
#[must_use]
#[derive(Debug)]
pub enum EnqueueStatus {
    /// The policy took ownership of the request.
    Queued,
    /// The policy does not handle this request; the caller must route it
    /// elsewhere.
    Rejected(Bio),
}

impl EnqueueStatus {
    /// Returns true if the request was queued.
    #[inline]
    pub fn is_queued(&self) -> bool {
        matches!(self, EnqueueStatus::Queued)
    }
}

/// A per-device disk-scheduling policy.
///
/// Every entrypoint is callable from any thread. Only [`on_completion`]
/// may run in a context that must not block.
///
/// [`on_completion`]: DiskSchedPolicy::on_completion
pub trait DiskSchedPolicy: Send + Sync {
    /// Policy name.
    fn name(&self) -> &'static str;

    /// Initializes per-device state.
    fn prepare(&self) -> BfqResult<()>;

    /// Releases per-device state, cancelling anything still queued.
    fn teardown(&self) -> BfqResult<()>;

    /// Cancels every queued request. Idempotent.
    fn cancel_all(&self);

    /// Submits a request on behalf of `tdio`.
    fn enqueue(&self, tdio: &Arc<ThreadIo>, bio: Bio) -> EnqueueStatus;

    /// Creates the context for a new submitter.
    fn new_submitter(&self) -> Arc<ThreadIo>;

    /// Notifies the policy that a submitter is going away.
    fn destroy_submitter(&self, tdio: &Arc<ThreadIo>);

    /// Notifies the policy that a dispatched request finished.
    fn on_completion(&self, bio: &mut Bio);

    /// Gives the policy a chance to dispatch, e.g. after slots freed up.
    fn poll(&self);
}
