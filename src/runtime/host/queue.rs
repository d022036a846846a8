//! Host worker lanes
//!
//! Submissions are handed round-robin to a fixed set of worker threads. A
//! task first waits for its dependency events, then runs. Dependencies always
//! refer to earlier submissions, so the oldest unfinished task can always
//! make progress and the lanes never deadlock.

use log::warn;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Default lane count when none is configured
pub(crate) fn default_lanes() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().clamp(1, 4))
        .unwrap_or(1)
}

pub(crate) struct WorkerLanes {
    senders: Vec<Sender<Task>>,
    next: AtomicUsize,
}

impl WorkerLanes {
    /// Spawn `lanes` worker threads
    ///
    /// With zero lanes (or if no thread could be spawned) tasks run inline on
    /// the submitting thread.
    pub(crate) fn new(lanes: usize) -> Self {
        let mut senders = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel::<Task>();
            let spawned = thread::Builder::new()
                .name(format!("hetla-host-{}", lane))
                .spawn(move || {
                    // Exits once the backend drops its sender
                    for task in rx {
                        task();
                    }
                });
            match spawned {
                Ok(_) => senders.push(tx),
                Err(e) => warn!("failed to spawn host lane {}: {}", lane, e),
            }
        }
        Self {
            senders,
            next: AtomicUsize::new(0),
        }
    }

    /// Number of live lanes
    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }

    /// Hand a task to the next lane
    pub(crate) fn dispatch(&self, task: Task) {
        if self.senders.is_empty() {
            task();
            return;
        }
        let lane = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if let Err(mpsc::SendError(task)) = self.senders[lane].send(task) {
            // Lane thread is gone; run on the caller
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_lanes_run_tasks() {
        let lanes = WorkerLanes::new(2);
        assert_eq!(lanes.len(), 2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let counter = counter.clone();
            let tx = tx.clone();
            lanes.dispatch(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..8 {
            rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_zero_lanes_run_inline() {
        let lanes = WorkerLanes::new(0);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        lanes.dispatch(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
