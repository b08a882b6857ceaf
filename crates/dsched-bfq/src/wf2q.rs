//! WF2Q+ ordering of ready submitters.
//!
//! Every ready (queued but not active) submitter sits in the tree keyed by its
//! virtual finish time, `start + budget / weight`. Selection takes the smallest
//! finish time; equal finish times are served in insertion order. A
//! submitter's start is never allowed to fall behind the tree's virtual time,
//! so one that sat idle cannot bank credit.

use std::collections::{BTreeMap, HashMap};

use tracing::{trace, warn};

use crate::tdio::SubmitterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FinishKey {
    finish: u64,
    seq: u64,
}

#[derive(Debug)]
struct Entry<T> {
    id: SubmitterId,
    start: u64,
    item: T,
}

/// A submitter taken out of the tree by [`Wf2qTree::pop_next`].
#[derive(Debug)]
pub struct Selected<T> {
    /// Submitter ID.
    pub id: SubmitterId,
    /// Virtual start time it was inserted with.
    pub start: u64,
    /// Virtual finish time it was ordered by.
    pub finish: u64,
    /// The stored item.
    pub item: T,
}

/// Virtual-time ordered set of ready submitters.
#[derive(Debug)]
pub struct Wf2qTree<T> {
    entries: BTreeMap<FinishKey, Entry<T>>,
    index: HashMap<SubmitterId, FinishKey>,
    virtual_time: u64,
    next_seq: u64,
    total_service: u64,
}

impl<T> Wf2qTree<T> {
    /// Creates an empty tree at virtual time zero.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            virtual_time: 0,
            next_seq: 0,
            total_service: 0,
        }
    }

    /// Inserts a submitter whose own virtual start is `start`.
    ///
    /// Returns the effective start (never behind the tree's virtual time), or
    /// `None` if the submitter is already present; a submitter is never
    /// queued twice.
    pub fn insert(
        &mut self,
        id: SubmitterId,
        start: u64,
        budget: u64,
        weight: u32,
        item: T,
    ) -> Option<u64> {
        if self.index.contains_key(&id) {
            warn!("{} already in WF2Q tree, insert ignored", id);
            return None;
        }

        let start = start.max(self.virtual_time);
        let finish = start.saturating_add(budget / u64::from(weight.max(1)));
        let key = FinishKey {
            finish,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.entries.insert(key, Entry { id, start, item });
        self.index.insert(id, key);
        trace!(%id, start, finish, ready = self.entries.len(), "WF2Q insert");
        Some(start)
    }

    /// Removes and returns the submitter with the smallest finish time,
    /// advancing the virtual time to its start.
    pub fn pop_next(&mut self) -> Option<Selected<T>> {
        let (key, entry) = self.entries.pop_first()?;
        self.index.remove(&entry.id);
        self.virtual_time = self.virtual_time.max(entry.start);
        trace!(id = %entry.id, finish = key.finish, vtime = self.virtual_time, "WF2Q select");
        Some(Selected {
            id: entry.id,
            start: entry.start,
            finish: key.finish,
            item: entry.item,
        })
    }

    /// Removes a specific submitter.
    pub fn remove(&mut self, id: SubmitterId) -> Option<T> {
        let key = self.index.remove(&id)?;
        self.entries.remove(&key).map(|e| e.item)
    }

    /// Returns the ID that [`pop_next`](Self::pop_next) would select.
    pub fn peek_next(&self) -> Option<SubmitterId> {
        self.entries.first_key_value().map(|(_, e)| e.id)
    }

    /// Returns true if the submitter is in the tree.
    #[inline]
    pub fn contains(&self, id: SubmitterId) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of ready submitters.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no submitter is ready.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current system virtual time.
    #[inline]
    pub fn virtual_time(&self) -> u64 {
        self.virtual_time
    }

    /// Accounts service handed to the device.
    #[inline]
    pub fn add_service(&mut self, bytes: u64) {
        self.total_service = self.total_service.saturating_add(bytes);
    }

    /// Total service dispatched through this tree.
    #[inline]
    pub fn total_service(&self) -> u64 {
        self.total_service
    }

    /// IDs in selection order.
    pub fn ids(&self) -> Vec<SubmitterId> {
        self.entries.values().map(|e| e.id).collect()
    }
}

impl<T> Default for Wf2qTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> SubmitterId {
        SubmitterId(n)
    }

    #[test]
    fn test_empty_tree() {
        let mut tree: Wf2qTree<()> = Wf2qTree::new();
        assert!(tree.is_empty());
        assert!(tree.pop_next().is_none());
        assert!(tree.peek_next().is_none());
    }

    #[test]
    fn test_smallest_finish_first() {
        let mut tree = Wf2qTree::new();
        tree.insert(id(1), 0, 64, 1, "big");
        tree.insert(id(2), 0, 16, 1, "small");
        tree.insert(id(3), 0, 32, 1, "mid");

        assert_eq!(tree.pop_next().unwrap().item, "small");
        assert_eq!(tree.pop_next().unwrap().item, "mid");
        assert_eq!(tree.pop_next().unwrap().item, "big");
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let mut tree = Wf2qTree::new();
        for n in 1..=5 {
            tree.insert(id(n), 0, 16, 1, n);
        }
        let order: Vec<u64> = std::iter::from_fn(|| tree.pop_next().map(|s| s.item)).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_weight_scales_finish_time() {
        let mut tree = Wf2qTree::new();
        tree.insert(id(1), 0, 64, 1, ());
        tree.insert(id(2), 0, 64, 8, ());
        let first = tree.pop_next().unwrap();
        assert_eq!(first.id, id(2));
        assert_eq!(first.finish, 8);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut tree = Wf2qTree::new();
        assert_eq!(tree.insert(id(1), 0, 16, 1, ()), Some(0));
        assert_eq!(tree.insert(id(1), 0, 16, 1, ()), None);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_start_clamped_to_virtual_time() {
        let mut tree = Wf2qTree::new();
        tree.insert(id(1), 100, 16, 1, ());
        tree.pop_next().unwrap();
        assert_eq!(tree.virtual_time(), 100);

        // A long-idle submitter re-enters at the current virtual time.
        assert_eq!(tree.insert(id(2), 0, 16, 1, ()), Some(100));
    }

    #[test]
    fn test_virtual_time_is_monotonic() {
        let mut tree = Wf2qTree::new();
        tree.insert(id(1), 50, 16, 1, ());
        tree.pop_next().unwrap();
        tree.insert(id(2), 10, 0, 1, ());
        tree.pop_next().unwrap();
        assert_eq!(tree.virtual_time(), 50);
    }

    #[test]
    fn test_remove_and_contains() {
        let mut tree = Wf2qTree::new();
        tree.insert(id(1), 0, 16, 1, 'a');
        tree.insert(id(2), 0, 16, 1, 'b');
        assert!(tree.contains(id(1)));
        assert_eq!(tree.remove(id(1)), Some('a'));
        assert!(!tree.contains(id(1)));
        assert_eq!(tree.remove(id(1)), None);
        assert_eq!(tree.peek_next(), Some(id(2)));
    }

    #[test]
    fn test_proportional_share_over_rounds() {
        // Two always-backlogged submitters charged their full budget each
        // round; the weight-3 one should be served three times as often.
        let mut tree = Wf2qTree::new();
        let mut starts = [0u64; 2];
        let weights = [1u32, 3];
        tree.insert(id(0), 0, 30, weights[0], 0usize);
        tree.insert(id(1), 0, 30, weights[1], 1usize);

        let mut served = [0u32; 2];
        for _ in 0..40 {
            let sel = tree.pop_next().unwrap();
            let i = sel.item;
            served[i] += 1;
            starts[i] = sel.start + 30 / u64::from(weights[i]);
            tree.insert(sel.id, starts[i], 30, weights[i], i);
        }
        assert_eq!(served[0] + served[1], 40);
        assert!(served[1] >= 29 && served[1] <= 31, "served={:?}", served);
    }

    #[test]
    fn test_total_service_accumulates() {
        let mut tree: Wf2qTree<()> = Wf2qTree::new();
        tree.add_service(4096);
        tree.add_service(8192);
        assert_eq!(tree.total_service(), 12288);
    }
}
