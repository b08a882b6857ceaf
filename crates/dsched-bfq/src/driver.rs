//! Interface to the device driver below the scheduler.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use crate::bio::{Bio, BioId};
use crate::tdio::SubmitterId;

/// Tag-queue admission and request hand-off for one device.
pub trait DiskDriver: Send + Sync {
    /// Total request slots the device accepts.
    fn max_slots(&self) -> usize;

    /// Slots currently occupied by dispatched, uncompleted requests.
    fn slots_in_use(&self) -> usize;

    /// Hands a request to the device. Completion arrives later, out of band.
    ///
    /// Never called with the scheduler's device lock held.
    fn dispatch(&self, bio: Bio);

    /// Fails a request back to its issuer without performing it.
    fn cancel(&self, bio: Bio) {
        debug!(id = ?bio.id, "request cancelled");
    }
}

#[derive(Debug, Default)]
struct MockDiskState {
    max_slots: usize,
    in_flight: VecDeque<Bio>,
    dispatched: Vec<(BioId, Option<SubmitterId>)>,
    cancelled: Vec<BioId>,
}

/// In-memory driver that parks dispatched requests until told to complete.
#[derive(Debug)]
pub struct MockDisk {
    state: Mutex<MockDiskState>,
}

impl MockDisk {
    /// Creates a device with the given tag-queue depth.
    pub fn new(max_slots: usize) -> Self {
        Self {
            state: Mutex::new(MockDiskState {
                max_slots,
                ..Default::default()
            }),
        }
    }

    /// Changes the tag-queue depth.
    pub fn set_max_slots(&self, max_slots: usize) {
        self.state.lock().max_slots = max_slots;
    }

    /// Removes the oldest in-flight request so the caller can complete it.
    pub fn take_completed(&self) -> Option<Bio> {
        self.state.lock().in_flight.pop_front()
    }

    /// Removes every in-flight request.
    pub fn take_all_completed(&self) -> Vec<Bio> {
        self.state.lock().in_flight.drain(..).collect()
    }

    /// Number of in-flight requests.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Dispatch log in order, with the owner each request carried.
    pub fn dispatched(&self) -> Vec<(BioId, Option<SubmitterId>)> {
        self.state.lock().dispatched.clone()
    }

    /// IDs of cancelled requests in order.
    pub fn cancelled(&self) -> Vec<BioId> {
        self.state.lock().cancelled.clone()
    }
}

impl DiskDriver for MockDisk {
    fn max_slots(&self) -> usize {
        self.state.lock().max_slots
    }

    fn slots_in_use(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn dispatch(&self, bio: Bio) {
        let mut st = self.state.lock();
        st.dispatched.push((bio.id, bio.owner_id()));
        st.in_flight.push_back(bio);
    }

    fn cancel(&self, bio: Bio) {
        self.state.lock().cancelled.push(bio.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::BioKind;

    #[test]
    fn test_mock_disk_slot_accounting() {
        let disk = MockDisk::new(2);
        assert_eq!(disk.max_slots(), 2);
        assert_eq!(disk.slots_in_use(), 0);

        disk.dispatch(Bio::new(BioId(1), BioKind::Read, 0, 4096));
        disk.dispatch(Bio::new(BioId(2), BioKind::Read, 4096, 4096));
        assert_eq!(disk.slots_in_use(), 2);

        let done = disk.take_completed().unwrap();
        assert_eq!(done.id, BioId(1));
        assert_eq!(disk.slots_in_use(), 1);
        assert_eq!(disk.dispatched().len(), 2);
    }

    #[test]
    fn test_mock_disk_cancel_log() {
        let disk = MockDisk::new(1);
        disk.cancel(Bio::new(BioId(5), BioKind::Write, 0, 512));
        assert_eq!(disk.cancelled(), vec![BioId(5)]);
        assert_eq!(disk.slots_in_use(), 0);
    }

    #[test]
    fn test_set_max_slots() {
        let disk = MockDisk::new(0);
        disk.set_max_slots(8);
        assert_eq!(disk.max_slots(), 8);
    }
}
