//! Block requests as seen by the scheduler.
//!
//! A [`Bio`] is owned by the caller and the driver; the scheduler holds it only
//! while it is queued and attaches a back-reference to the submitter that
//! issued it. The back-reference keeps the submitter alive until the request
//! completes or is cancelled.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tdio::{SubmitterId, ThreadIo};

/// Unique identifier of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BioId(pub u64);

/// Kind of block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BioKind {
    /// Read data from the device
    Read,
    /// Write data to the device
    Write,
    /// Flush the device write cache
    Flush,
    /// Discard/trim a range
    Discard,
}

impl BioKind {
    /// Returns true for requests that move data and are charged to a budget.
    #[inline]
    pub fn is_read_write(&self) -> bool {
        matches!(self, BioKind::Read | BioKind::Write)
    }
}

impl fmt::Display for BioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BioKind::Read => write!(f, "read"),
            BioKind::Write => write!(f, "write"),
            BioKind::Flush => write!(f, "flush"),
            BioKind::Discard => write!(f, "discard"),
        }
    }
}

/// A block request.
pub struct Bio {
    /// Request identifier.
    pub id: BioId,
    /// Kind of request.
    pub kind: BioKind,
    /// Starting byte offset on the device.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
    owner: Option<Arc<ThreadIo>>,
    activation: u64,
}

impl Bio {
    /// Creates a request with no owner attached.
    pub fn new(id: BioId, kind: BioKind, offset: u64, size: u64) -> Self {
        Self {
            id,
            kind,
            offset,
            size,
            owner: None,
            activation: 0,
        }
    }

    /// Byte offset just past the end of this request.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// ID of the submitter this request is attached to, if any.
    pub fn owner_id(&self) -> Option<SubmitterId> {
        self.owner.as_ref().map(|t| t.id())
    }

    /// Returns true while the request holds a submitter reference.
    #[inline]
    pub fn has_owner(&self) -> bool {
        self.owner.is_some()
    }

    pub(crate) fn attach(&mut self, owner: Arc<ThreadIo>) {
        self.owner = Some(owner);
    }

    /// Drops the submitter reference. Called once per request on completion
    /// or cancellation.
    pub(crate) fn detach(&mut self) -> Option<Arc<ThreadIo>> {
        self.owner.take()
    }

    pub(crate) fn activation(&self) -> u64 {
        self.activation
    }

    pub(crate) fn set_activation(&mut self, activation: u64) {
        self.activation = activation;
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("owner", &self.owner_id())
            .finish()
    }
}

/// Atomic counter for generating unique request IDs.
#[derive(Debug)]
pub struct BioIdGen {
    next: AtomicU64,
}

impl BioIdGen {
    /// Create a new ID generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next unique request ID.
    pub fn next_id(&self) -> BioId {
        BioId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for BioIdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_classification() {
        assert!(BioKind::Read.is_read_write());
        assert!(BioKind::Write.is_read_write());
        assert!(!BioKind::Flush.is_read_write());
        assert!(!BioKind::Discard.is_read_write());
    }

    #[test]
    fn test_end_offset() {
        let bio = Bio::new(BioId(1), BioKind::Read, 4096, 8192);
        assert_eq!(bio.end_offset(), 12288);

        let edge = Bio::new(BioId(2), BioKind::Read, u64::MAX - 1, 4096);
        assert_eq!(edge.end_offset(), u64::MAX);
    }

    #[test]
    fn test_new_bio_has_no_owner() {
        let bio = Bio::new(BioId(1), BioKind::Write, 0, 512);
        assert!(!bio.has_owner());
        assert_eq!(bio.owner_id(), None);
    }

    #[test]
    fn test_attach_detach_releases_reference() {
        let tdio = Arc::new(ThreadIo::new(SubmitterId(3), 16384, 1));
        let mut bio = Bio::new(BioId(1), BioKind::Read, 0, 512);

        bio.attach(Arc::clone(&tdio));
        assert_eq!(Arc::strong_count(&tdio), 2);
        assert_eq!(bio.owner_id(), Some(SubmitterId(3)));

        assert!(bio.detach().is_some());
        assert!(bio.detach().is_none());
        assert_eq!(Arc::strong_count(&tdio), 1);
    }

    #[test]
    fn test_id_gen_is_monotonic() {
        let gen = BioIdGen::new();
        assert_eq!(gen.next_id(), BioId(1));
        assert_eq!(gen.next_id(), BioId(2));
        assert_eq!(gen.next_id(), BioId(3));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", BioKind::Read), "read");
        assert_eq!(format!("{}", BioKind::Flush), "flush");
    }
}
