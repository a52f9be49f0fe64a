//! Work coalescing for single-writer targets
//!
//! Several committers may produce updates for the same target (the label
//! scan store, the property indexes) at once. Each producer enqueues its work
//! and tries to become the executor. The executor drains everything pending,
//! combines it into one unit and applies it in a single call. Producers that
//! did not get the executor role wait until their own ticket is reported done.

use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

/// A unit of work that can be merged with others before being applied
pub trait Work<T>: Sized + Send {
    /// Merge `other` into `self`
    fn combine(&mut self, other: Self);

    /// Apply the (combined) work to the target
    fn apply(self, target: &mut T) -> Result<()>;
}

struct Pending<W> {
    queue: Vec<(u64, W)>,
    next_ticket: u64,
    done: HashMap<u64, Option<String>>,
    executing: bool,
}

/// Coalesces work from concurrent producers onto one target
pub struct WorkSync<T, W> {
    target: Mutex<T>,
    pending: Mutex<Pending<W>>,
    completed: Condvar,
}

impl<T, W: Work<T>> WorkSync<T, W> {
    /// Wrap `target`
    pub fn new(target: T) -> Self {
        Self {
            target: Mutex::new(target),
            pending: Mutex::new(Pending {
                queue: Vec::new(),
                next_ticket: 0,
                done: HashMap::new(),
                executing: false,
            }),
            completed: Condvar::new(),
        }
    }

    /// Submit `work` and return once it has been applied, possibly by another thread.
    ///
    /// Each submitted unit is applied exactly once. If the combined batch it
    /// was part of fails, every producer of that batch gets an error.
    pub fn apply(&self, work: W) -> Result<()> {
        let mut pending = self.pending.lock();
        let ticket = pending.next_ticket;
        pending.next_ticket += 1;
        pending.queue.push((ticket, work));

        loop {
            if let Some(outcome) = pending.done.remove(&ticket) {
                return match outcome {
                    None => Ok(()),
                    Some(message) => Err(Error::storage(format!(
                        "coalesced update failed: {}",
                        message
                    ))),
                };
            }
            if pending.executing {
                // woken when the running executor hands the role back
                self.completed.wait(&mut pending);
                continue;
            }

            pending.executing = true;
            let batch = std::mem::take(&mut pending.queue);
            drop(pending);

            let (tickets, outcome) = self.execute(batch);

            pending = self.pending.lock();
            for ticket in tickets {
                pending.done.insert(ticket, outcome.clone());
            }
            pending.executing = false;
            self.completed.notify_all();
        }
    }

    fn execute(&self, batch: Vec<(u64, W)>) -> (Vec<u64>, Option<String>) {
        let mut tickets = Vec::with_capacity(batch.len());
        let mut combined: Option<W> = None;
        for (ticket, work) in batch {
            tickets.push(ticket);
            match combined.as_mut() {
                Some(c) => c.combine(work),
                None => combined = Some(work),
            }
        }

        let outcome = match combined {
            Some(work) => work
                .apply(&mut self.target.lock())
                .err()
                .map(|e| e.to_string()),
            None => None,
        };
        if let Some(message) = &outcome {
            tracing::error!("Applying {} coalesced updates failed: {}", tickets.len(), message);
        }
        (tickets, outcome)
    }

    /// Run `f` with exclusive access to the target
    pub fn with_target<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.target.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Add(Vec<u64>);

    impl Work<Vec<u64>> for Add {
        fn combine(&mut self, other: Self) {
            self.0.extend(other.0);
        }

        fn apply(self, target: &mut Vec<u64>) -> Result<()> {
            if self.0.contains(&u64::MAX) {
                return Err(Error::internal("poisoned"));
            }
            target.extend(self.0);
            Ok(())
        }
    }

    #[test]
    fn test_single_producer() {
        let sync = WorkSync::new(Vec::new());
        sync.apply(Add(vec![1, 2])).unwrap();
        sync.apply(Add(vec![3])).unwrap();
        assert_eq!(sync.with_target(|t| t.clone()), vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_work_applied_exactly_once() {
        let sync = Arc::new(WorkSync::new(Vec::new()));
        let mut handles = Vec::new();
        for thread in 0..8u64 {
            let sync = Arc::clone(&sync);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    sync.apply(Add(vec![thread * 1000 + i])).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut applied = sync.with_target(|t| t.clone());
        assert_eq!(applied.len(), 800);
        applied.sort_unstable();
        applied.dedup();
        assert_eq!(applied.len(), 800);
    }

    #[test]
    fn test_failure_reported_to_producer() {
        let sync = WorkSync::new(Vec::new());
        assert!(sync.apply(Add(vec![u64::MAX])).is_err());
        sync.apply(Add(vec![4])).unwrap();
        assert_eq!(sync.with_target(|t| t.clone()), vec![4]);
    }

    #[test]
    fn test_work_queued_behind_busy_executor_is_combined() {
        use std::sync::Barrier;

        struct Gated {
            items: Vec<u64>,
            gate: Option<(Arc<Barrier>, Arc<Barrier>)>,
            calls: Arc<AtomicUsize>,
        }

        impl Work<Vec<u64>> for Gated {
            fn combine(&mut self, other: Self) {
                self.items.extend(other.items);
                if self.gate.is_none() {
                    self.gate = other.gate;
                }
            }

            fn apply(self, target: &mut Vec<u64>) -> Result<()> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some((entered, release)) = self.gate {
                    entered.wait();
                    release.wait();
                }
                target.extend(self.items);
                Ok(())
            }
        }

        const PRODUCERS: u64 = 6;
        let calls = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let sync = Arc::new(WorkSync::new(Vec::new()));

        let first = {
            let sync = Arc::clone(&sync);
            let work = Gated {
                items: vec![0],
                gate: Some((Arc::clone(&entered), Arc::clone(&release))),
                calls: Arc::clone(&calls),
            };
            std::thread::spawn(move || sync.apply(work))
        };
        // the first producer is now executing and holds the target
        entered.wait();

        let producers: Vec<_> = (1..=PRODUCERS)
            .map(|i| {
                let sync = Arc::clone(&sync);
                let work = Gated {
                    items: vec![i],
                    gate: None,
                    calls: Arc::clone(&calls),
                };
                std::thread::spawn(move || sync.apply(work))
            })
            .collect();
        while sync.pending.lock().queue.len() < PRODUCERS as usize {
            std::thread::yield_now();
        }
        release.wait();

        first.join().unwrap().unwrap();
        for producer in producers {
            producer.join().unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let mut applied = sync.with_target(|t| t.clone());
        applied.sort_unstable();
        assert_eq!(applied, (0..=PRODUCERS).collect::<Vec<_>>());
    }
}
