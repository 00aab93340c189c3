//! Tracker storage for the filler: a slab that owns the trackers plus
//! doubly-linked lists threaded through the slab slots, one list per
//! (longest-free, allocation-count) bin, with a bitmap of non-empty bins
//! for O(1) find-least-bin queries.

use super::bitmap::Bitmap;
use super::page_tracker::PageTracker;

/// Handle to a tracker owned by a filler. Valid from `contribute` until the
/// `put` that drains the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackerId(pub(crate) u32);

pub(crate) const NIL: u32 = u32::MAX;

struct Slot {
    tracker: PageTracker,
    prev: u32,
    next: u32,
}

/// Owns every tracker contributed to a filler. Slots are reused through a
/// free list; list links live in the slots so membership changes never
/// allocate.
pub(crate) struct TrackerSlab {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
}

impl TrackerSlab {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, tracker: PageTracker) -> u32 {
        let slot = Slot {
            tracker,
            prev: NIL,
            next: NIL,
        };
        if let Some(id) = self.free.pop() {
            debug_assert!(self.slots[id as usize].is_none());
            self.slots[id as usize] = Some(slot);
            id
        } else {
            self.slots.push(Some(slot));
            (self.slots.len() - 1) as u32
        }
    }

    pub fn remove(&mut self, id: u32) -> PageTracker {
        let slot = self.slots[id as usize]
            .take()
            .expect("remove of vacant tracker slot");
        self.free.push(id);
        slot.tracker
    }

    #[inline]
    pub fn tracker(&self, id: u32) -> &PageTracker {
        &self.slot(id).tracker
    }

    #[inline]
    pub fn tracker_mut(&mut self, id: u32) -> &mut PageTracker {
        &mut self.slot_mut(id).tracker
    }

    #[inline]
    fn slot(&self, id: u32) -> &Slot {
        self.slots[id as usize]
            .as_ref()
            .expect("vacant tracker slot")
    }

    #[inline]
    fn slot_mut(&mut self, id: u32) -> &mut Slot {
        self.slots[id as usize]
            .as_mut()
            .expect("vacant tracker slot")
    }
}

/// An array of tracker lists plus a bitmap of which lists are non-empty.
///
/// Later lists strictly dominate earlier ones for allocation suitability,
/// so `get_least(k)` (pop from the first non-empty list at or after `k`)
/// yields the best candidate that can still satisfy the request.
pub(crate) struct HintedTrackerLists {
    heads: Vec<u32>,
    lens: Vec<u32>,
    nonempty: Bitmap,
    size: usize,
}

impl HintedTrackerLists {
    pub fn new(n: usize) -> Self {
        Self {
            heads: vec![NIL; n],
            lens: vec![0; n],
            nonempty: Bitmap::new(n),
            size: 0,
        }
    }

    /// Total trackers across all lists.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn len_of(&self, list: usize) -> usize {
        self.lens[list] as usize
    }

    /// Push `id` onto the front of `list`.
    pub fn add(&mut self, slab: &mut TrackerSlab, id: u32, list: usize) {
        let head = self.heads[list];
        {
            let slot = slab.slot_mut(id);
            slot.prev = NIL;
            slot.next = head;
        }
        if head != NIL {
            slab.slot_mut(head).prev = id;
        }
        self.heads[list] = id;
        if self.lens[list] == 0 {
            self.nonempty.set_range(list, 1);
        }
        self.lens[list] += 1;
        self.size += 1;
    }

    /// Unlink `id` from `list`.
    pub fn remove(&mut self, slab: &mut TrackerSlab, id: u32, list: usize) {
        debug_assert!(self.lens[list] > 0);
        let (prev, next) = {
            let slot = slab.slot(id);
            (slot.prev, slot.next)
        };
        if prev != NIL {
            slab.slot_mut(prev).next = next;
        } else {
            debug_assert_eq!(self.heads[list], id, "tracker not on the claimed list");
            self.heads[list] = next;
        }
        if next != NIL {
            slab.slot_mut(next).prev = prev;
        }
        self.lens[list] -= 1;
        if self.lens[list] == 0 {
            self.nonempty.clear_range(list, 1);
        }
        self.size -= 1;
    }

    /// Pop the head of the first non-empty list at or after `start`.
    pub fn get_least(&mut self, slab: &mut TrackerSlab, start: usize) -> Option<u32> {
        let list = self.nonempty.find_set(start)?;
        let id = self.heads[list];
        debug_assert_ne!(id, NIL);
        self.remove(slab, id, list);
        Some(id)
    }

    /// Visit every tracker in lists `start..`, in list order.
    pub fn iter(&self, slab: &TrackerSlab, start: usize, mut f: impl FnMut(u32)) {
        let mut list = start;
        while let Some(l) = self.nonempty.find_set(list) {
            let mut id = self.heads[l];
            while id != NIL {
                f(id);
                id = slab.slot(id).next;
            }
            list = l + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hugepages::pages::HugePage;

    fn slab_with(n: usize) -> (TrackerSlab, Vec<u32>) {
        let mut slab = TrackerSlab::new();
        let ids = (0..n)
            .map(|i| slab.insert(PageTracker::new(HugePage::new(i), false)))
            .collect();
        (slab, ids)
    }

    #[test]
    fn test_get_least_prefers_earliest_bin() {
        let (mut slab, ids) = slab_with(3);
        let mut lists = HintedTrackerLists::new(16);
        lists.add(&mut slab, ids[0], 4);
        lists.add(&mut slab, ids[1], 9);
        lists.add(&mut slab, ids[2], 9);
        assert_eq!(lists.size(), 3);

        assert_eq!(lists.get_least(&mut slab, 0), Some(ids[0]));
        // Most recently added is at the front of its list.
        assert_eq!(lists.get_least(&mut slab, 5), Some(ids[2]));
        assert_eq!(lists.get_least(&mut slab, 0), Some(ids[1]));
        assert_eq!(lists.get_least(&mut slab, 0), None);
        assert_eq!(lists.size(), 0);
    }

    #[test]
    fn test_get_least_respects_lower_bound() {
        let (mut slab, ids) = slab_with(1);
        let mut lists = HintedTrackerLists::new(16);
        lists.add(&mut slab, ids[0], 3);
        assert_eq!(lists.get_least(&mut slab, 4), None);
        assert_eq!(lists.get_least(&mut slab, 3), Some(ids[0]));
    }

    #[test]
    fn test_remove_from_middle() {
        let (mut slab, ids) = slab_with(3);
        let mut lists = HintedTrackerLists::new(8);
        for &id in &ids {
            lists.add(&mut slab, id, 2);
        }
        // List front-to-back: ids[2], ids[1], ids[0]; unlink the middle.
        lists.remove(&mut slab, ids[1], 2);
        let mut seen = Vec::new();
        lists.iter(&slab, 0, |id| seen.push(id));
        assert_eq!(seen, vec![ids[2], ids[0]]);
        assert_eq!(lists.len_of(2), 2);
    }

    #[test]
    fn test_bitmap_hint_tracks_emptiness() {
        let (mut slab, ids) = slab_with(2);
        let mut lists = HintedTrackerLists::new(64);
        lists.add(&mut slab, ids[0], 63);
        lists.add(&mut slab, ids[1], 63);
        lists.remove(&mut slab, ids[0], 63);
        assert_eq!(lists.get_least(&mut slab, 10), Some(ids[1]));
        assert_eq!(lists.get_least(&mut slab, 0), None);
    }

    #[test]
    fn test_iter_spans_lists_in_order() {
        let (mut slab, ids) = slab_with(4);
        let mut lists = HintedTrackerLists::new(8);
        lists.add(&mut slab, ids[0], 1);
        lists.add(&mut slab, ids[1], 5);
        lists.add(&mut slab, ids[2], 5);
        lists.add(&mut slab, ids[3], 7);
        let mut seen = Vec::new();
        lists.iter(&slab, 2, |id| seen.push(id));
        assert_eq!(seen, vec![ids[2], ids[1], ids[3]]);
    }

    #[test]
    fn test_slab_slot_reuse() {
        let mut slab = TrackerSlab::new();
        let a = slab.insert(PageTracker::new(HugePage::new(1), false));
        let t = slab.remove(a);
        assert_eq!(t.location(), HugePage::new(1));
        let b = slab.insert(PageTracker::new(HugePage::new(2), false));
        assert_eq!(a, b);
        assert_eq!(slab.tracker(b).location(), HugePage::new(2));
    }
}
