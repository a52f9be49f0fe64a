//! Record id allocation with buffered reuse
//!
//! Freed ids are not handed out again right away: a reader that started
//! before the delete may still follow a pointer to the slot. Frees land in a
//! buffer and only become reusable after [`IdController::maintenance`] runs.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Allocator of record ids for one store
#[derive(Debug)]
pub struct IdGenerator {
    high_id: AtomicU64,
    free: Mutex<Vec<u64>>,
    buffered: Mutex<Vec<u64>>,
    reuse: bool,
}

impl IdGenerator {
    /// Create a generator whose next fresh id is `high_id`
    pub fn new(high_id: u64, reuse: bool) -> Self {
        Self {
            high_id: AtomicU64::new(high_id),
            free: Mutex::new(Vec::new()),
            buffered: Mutex::new(Vec::new()),
            reuse,
        }
    }

    /// Hand out an id: a released free id if reuse is on, otherwise a fresh one
    pub fn next_id(&self) -> u64 {
        if self.reuse {
            if let Some(id) = self.free.lock().pop() {
                return id;
            }
        }
        self.high_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Lowest id never handed out
    pub fn high_id(&self) -> u64 {
        self.high_id.load(Ordering::SeqCst)
    }

    /// Raise the high id so that `id` is covered; never lowers it
    pub fn raise_high_id(&self, id: u64) {
        self.high_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    /// Record that `id` holds a live record written without reserving it here.
    /// Covers it with the high id and takes it off the free and buffered lists.
    pub fn mark_used(&self, id: u64) {
        self.mark_all_used(&BTreeSet::from([id]));
    }

    /// [`mark_used`](Self::mark_used) for a set of ids
    pub fn mark_all_used(&self, ids: &BTreeSet<u64>) {
        let Some(&highest) = ids.last() else {
            return;
        };
        self.raise_high_id(highest);
        self.free.lock().retain(|id| !ids.contains(id));
        self.buffered.lock().retain(|id| !ids.contains(id));
    }

    /// Return an id that is no longer in use; it is buffered until maintenance
    pub fn free_id(&self, id: u64) {
        self.buffered.lock().push(id);
    }

    /// Return a reserved id that was never written (rolled back transaction)
    pub fn release_unused(&self, id: u64) {
        if self.reuse {
            self.free.lock().push(id);
        }
    }

    /// Move buffered frees to the reusable list; returns how many moved
    pub fn release_buffered(&self) -> usize {
        let mut buffered = self.buffered.lock();
        let moved = buffered.len();
        if self.reuse {
            let mut free = self.free.lock();
            free.extend(buffered.drain(..));
            free.sort_unstable_by(|a, b| b.cmp(a));
            free.dedup();
        } else {
            buffered.clear();
        }
        moved
    }

    /// Drop buffered frees without making them reusable
    pub fn clear_buffered(&self) {
        self.buffered.lock().clear();
    }

    /// Reset state from a scan of the store
    pub fn rebuild(&self, high_id: u64, mut free_ids: Vec<u64>) {
        free_ids.sort_unstable_by(|a, b| b.cmp(a));
        self.high_id.store(high_id, Ordering::SeqCst);
        *self.free.lock() = if self.reuse { free_ids } else { Vec::new() };
        self.buffered.lock().clear();
    }

    /// Number of ids ready for reuse
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of frees waiting for maintenance
    pub fn buffered_count(&self) -> usize {
        self.buffered.lock().len()
    }
}

/// Drives id maintenance across all stores while the engine runs
#[derive(Debug, Default)]
pub struct IdController {
    running: AtomicBool,
}

impl IdController {
    /// Create a stopped controller
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow maintenance
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop maintenance
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the controller is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Release buffered ids of every generator; no-op while stopped
    pub fn maintenance<'a>(&self, generators: impl IntoIterator<Item = &'a IdGenerator>) -> usize {
        if !self.is_running() {
            return 0;
        }
        generators.into_iter().map(|g| g.release_buffered()).sum()
    }

    /// Drop buffered ids of every generator
    pub fn clear<'a>(&self, generators: impl IntoIterator<Item = &'a IdGenerator>) {
        for generator in generators {
            generator.clear_buffered();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let ids = IdGenerator::new(0, true);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.high_id(), 2);
    }

    #[test]
    fn test_freed_ids_wait_for_maintenance() {
        let ids = IdGenerator::new(10, true);
        ids.free_id(3);
        assert_eq!(ids.buffered_count(), 1);
        assert_eq!(ids.next_id(), 10);

        assert_eq!(ids.release_buffered(), 1);
        assert_eq!(ids.next_id(), 3);
        assert_eq!(ids.next_id(), 11);
    }

    #[test]
    fn test_no_reuse_discards_frees() {
        let ids = IdGenerator::new(5, false);
        ids.free_id(1);
        ids.release_buffered();
        ids.release_unused(2);
        assert_eq!(ids.next_id(), 5);
        assert_eq!(ids.free_count(), 0);
    }

    #[test]
    fn test_raise_high_id_never_lowers() {
        let ids = IdGenerator::new(8, true);
        ids.raise_high_id(3);
        assert_eq!(ids.high_id(), 8);
        ids.raise_high_id(20);
        assert_eq!(ids.high_id(), 21);
    }

    #[test]
    fn test_mark_used_withdraws_free_and_buffered_ids() {
        let ids = IdGenerator::new(10, true);
        ids.rebuild(10, vec![2, 4]);
        ids.free_id(6);
        ids.free_id(7);

        ids.mark_all_used(&BTreeSet::from([2, 7, 12]));
        assert_eq!(ids.high_id(), 13);
        assert_eq!(ids.free_count(), 1);
        assert_eq!(ids.buffered_count(), 1);

        ids.release_buffered();
        assert_eq!(ids.next_id(), 4);
        assert_eq!(ids.next_id(), 6);
        assert_eq!(ids.next_id(), 13);

        ids.mark_used(13);
        assert_eq!(ids.high_id(), 14);
    }

    #[test]
    fn test_rebuild_prefers_lowest_free() {
        let ids = IdGenerator::new(0, true);
        ids.rebuild(10, vec![7, 2, 5]);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 5);
        assert_eq!(ids.next_id(), 7);
        assert_eq!(ids.next_id(), 10);
    }

    #[test]
    fn test_controller_only_runs_when_started() {
        let a = IdGenerator::new(0, true);
        let b = IdGenerator::new(0, true);
        a.free_id(1);
        b.free_id(2);

        let controller = IdController::new();
        assert_eq!(controller.maintenance([&a, &b]), 0);

        controller.start();
        assert_eq!(controller.maintenance([&a, &b]), 2);
        assert_eq!(a.free_count(), 1);

        a.free_id(4);
        controller.clear([&a]);
        assert_eq!(a.buffered_count(), 0);
    }
}
