//! Wake-up scheduling for cell ticks.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::pos::{BlockPos, SectionPos};

/// Priority queue of `(tick, cell)` wake-ups for one world, drained by
/// the tick thread. Cells parked on an unloaded section re-queue when
/// that section loads.
#[derive(Default)]
pub struct TickScheduler {
    queue: BinaryHeap<Reverse<(u64, BlockPos)>>,
    /// Guards against the same cell being queued twice for the same tick;
    /// wake storms would otherwise snowball the heap.
    queued: FxHashSet<(u64, BlockPos)>,
    parked: FxHashMap<SectionPos, Vec<BlockPos>>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, tick: u64, pos: BlockPos) {
        if self.queued.insert((tick, pos)) {
            self.queue.push(Reverse((tick, pos)));
        }
    }

    /// Schedules the 26 cells surrounding `pos` for the next tick. Called
    /// after every write that changes a cell.
    pub fn wake_surrounding(&mut self, now: u64, pos: BlockPos) {
        for dy in -1..=1 {
            for dz in -1..=1 {
                for dx in -1..=1 {
                    if (dx, dy, dz) != (0, 0, 0) {
                        self.schedule(now + 1, pos.offset(dx, dy, dz));
                    }
                }
            }
        }
    }

    /// Pops the next cell due at or before `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<BlockPos> {
        let &Reverse((tick, pos)) = self.queue.peek()?;
        if tick > now {
            return None;
        }

        self.queue.pop();
        self.queued.remove(&(tick, pos));
        Some(pos)
    }

    /// Parks a cell until `section` loads.
    pub fn park(&mut self, section: SectionPos, pos: BlockPos) {
        self.parked.entry(section).or_default().push(pos);
    }

    /// Re-queues everything parked on `section`; called by the world when
    /// the section finishes loading.
    pub fn section_loaded(&mut self, now: u64, section: SectionPos) {
        if let Some(cells) = self.parked.remove(&section) {
            for pos in cells {
                self.schedule(now + 1, pos);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn parked_cells(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.parked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_tick_order_and_never_early() {
        let mut sched = TickScheduler::new();
        sched.schedule(5, BlockPos::new(0, 0, 0));
        sched.schedule(2, BlockPos::new(1, 0, 0));

        assert_eq!(sched.pop_due(1), None);
        assert_eq!(sched.pop_due(2), Some(BlockPos::new(1, 0, 0)));
        assert_eq!(sched.pop_due(2), None);
        assert_eq!(sched.pop_due(10), Some(BlockPos::new(0, 0, 0)));
        assert!(sched.is_empty());
    }

    #[test]
    fn duplicate_wakeups_collapse() {
        let mut sched = TickScheduler::new();
        let pos = BlockPos::new(3, 3, 3);
        sched.schedule(1, pos);
        sched.schedule(1, pos);

        assert_eq!(sched.pop_due(1), Some(pos));
        assert_eq!(sched.pop_due(1), None);
    }

    #[test]
    fn wake_surrounding_hits_26_neighbors() {
        let mut sched = TickScheduler::new();
        sched.wake_surrounding(0, BlockPos::new(0, 0, 0));
        assert_eq!(sched.pending(), 26);

        let mut popped = 0;
        while sched.pop_due(1).is_some() {
            popped += 1;
        }
        assert_eq!(popped, 26);
    }

    #[test]
    fn parked_cells_requeue_on_section_load() {
        let mut sched = TickScheduler::new();
        let section = SectionPos::new(1, 0, 0);
        let pos = BlockPos::new(15, 0, 0);

        sched.park(section, pos);
        assert_eq!(sched.pop_due(100), None);

        sched.section_loaded(100, section);
        assert_eq!(sched.pop_due(101), Some(pos));
    }
}
