//! Blocking FIFO handoff between schedulers and workers.
//!
//! One container per queue. Producers block when the queue is at capacity,
//! except for reentrant submissions from a worker of the same queue, which
//! bypass admission so in-worker scheduling cannot deadlock. Consumption
//! honors a deactivation flag: a deactivated container behaves as empty
//! while still accepting items, and nothing is dropped across
//! deactivate/activate.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::work::Work;

thread_local! {
    /// Queue id the current thread consumes for, when it is a pool worker.
    static WORKER_QUEUE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Marks the current thread as a worker of `queue_id` for the guard's
/// lifetime. Submissions from such a thread into the same queue's container
/// are treated as reentrant.
pub struct WorkerScope;

impl WorkerScope {
    /// Enter worker scope for a queue on the current thread.
    pub fn enter(queue_id: &str) -> Self {
        WORKER_QUEUE.with(|q| *q.borrow_mut() = Some(queue_id.to_string()));
        WorkerScope
    }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        WORKER_QUEUE.with(|q| *q.borrow_mut() = None);
    }
}

fn is_reentrant(queue_id: &str) -> bool {
    WORKER_QUEUE.with(|q| q.borrow().as_deref() == Some(queue_id))
}

struct ContainerState {
    items: VecDeque<Work>,
    active: bool,
}

/// Blocking FIFO container with capacity-based admission and pause support.
pub struct BlockingContainer {
    queue_id: String,
    capacity: Option<usize>,
    state: Mutex<ContainerState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl BlockingContainer {
    /// Create a container for a queue. `capacity` of `None` is unbounded.
    #[must_use]
    pub fn new(queue_id: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            queue_id: queue_id.into(),
            capacity,
            state: Mutex::new(ContainerState {
                items: VecDeque::new(),
                active: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Admit an item, never dropping it. Non-reentrant callers block while
    /// the container holds `capacity` or more items; reentrant callers
    /// (worker threads of this same queue) bypass the admission check.
    /// Admission only binds while the container is active, so producers
    /// blocked at capacity cannot be stranded by a shutdown that has taken
    /// the consumers away.
    pub fn put(&self, work: Work) {
        let mut state = self.state.lock();
        if let Some(capacity) = self.capacity {
            if !is_reentrant(&self.queue_id) {
                while state.active && state.items.len() >= capacity {
                    self.not_full.wait(&mut state);
                }
            }
        }
        state.items.push_back(work);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Hand an item back without admission control. Used for rescheduling a
    /// unit pulled out during a race with deactivation or shutdown.
    pub fn put_unchecked(&self, work: Work) {
        let mut state = self.state.lock();
        state.items.push_back(work);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Take the next item, waiting up to `timeout`. Returns `None` on
    /// timeout or while the container is deactivated (a paused queue still
    /// accepts items but yields none to consumers).
    pub fn poll(&self, timeout: Duration) -> Option<Work> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.active {
                if let Some(work) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(work);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self
                .not_empty
                .wait_for(&mut state, deadline - now)
                .timed_out()
            {
                // re-check once in case of a wake racing the deadline
                if state.active {
                    if let Some(work) = state.items.pop_front() {
                        drop(state);
                        self.not_full.notify_one();
                        return Some(work);
                    }
                }
                return None;
            }
        }
    }

    /// Remove up to `max` items without blocking.
    pub fn drain(&self, max: usize) -> Vec<Work> {
        let mut state = self.state.lock();
        let n = max.min(state.items.len());
        let drained: Vec<Work> = state.items.drain(..n).collect();
        drop(state);
        self.not_full.notify_all();
        drained
    }

    /// Remove a specific scheduled item by id. Returns it when found.
    pub fn remove(&self, work_id: &str) -> Option<Work> {
        let mut state = self.state.lock();
        let pos = state.items.iter().position(|w| w.id == work_id)?;
        let removed = state.items.remove(pos);
        drop(state);
        self.not_full.notify_one();
        removed
    }

    /// Pause consumption. Items already queued are retained. Producers
    /// blocked on admission are released.
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        state.active = false;
        drop(state);
        // wake blocked consumers so short polls expire promptly
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Resume consumption.
    pub fn activate(&self) {
        let mut state = self.state.lock();
        state.active = true;
        drop(state);
        self.not_empty.notify_all();
    }

    /// Whether consumers currently see items.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Number of items held, including while deactivated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the container holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn work(id: &str) -> Work {
        Work::with_id(id, "cat", serde_json::Value::Null)
    }

    #[test]
    fn test_fifo_order() {
        let c = BlockingContainer::new("q", None);
        c.put(work("a"));
        c.put(work("b"));
        c.put(work("c"));
        assert_eq!(c.poll(Duration::from_millis(10)).unwrap().id, "a");
        assert_eq!(c.poll(Duration::from_millis(10)).unwrap().id, "b");
        assert_eq!(c.poll(Duration::from_millis(10)).unwrap().id, "c");
        assert!(c.poll(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_deactivated_behaves_empty_but_loses_nothing() {
        let c = BlockingContainer::new("q", None);
        c.deactivate();
        c.put(work("a"));
        assert!(c.poll(Duration::from_millis(20)).is_none());
        assert_eq!(c.len(), 1);
        c.activate();
        assert_eq!(c.poll(Duration::from_millis(100)).unwrap().id, "a");
    }

    #[test]
    fn test_put_blocks_at_capacity_until_slot_frees() {
        let c = Arc::new(BlockingContainer::new("q", Some(1)));
        c.put(work("a"));

        let c2 = Arc::clone(&c);
        let handle = thread::spawn(move || {
            c2.put(work("b")); // blocks until "a" is consumed
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(c.len(), 1);

        assert_eq!(c.poll(Duration::from_millis(100)).unwrap().id, "a");
        handle.join().unwrap();
        assert_eq!(c.poll(Duration::from_millis(100)).unwrap().id, "b");
    }

    #[test]
    fn test_deactivate_releases_blocked_producer() {
        let c = Arc::new(BlockingContainer::new("q", Some(1)));
        c.put(work("a"));

        let c2 = Arc::clone(&c);
        let handle = thread::spawn(move || {
            c2.put(work("b")); // blocks at capacity, no consumer will ever poll
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(c.len(), 1);

        c.deactivate();
        handle.join().unwrap();
        assert_eq!(c.len(), 2, "the released producer's item is retained");
    }

    #[test]
    fn test_reentrant_put_bypasses_admission() {
        let c = BlockingContainer::new("q", Some(1));
        c.put(work("a"));
        let _scope = WorkerScope::enter("q");
        // would deadlock without the reentrancy bypass
        c.put(work("b"));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_worker_scope_is_per_queue() {
        assert!(!is_reentrant("q"));
        let scope = WorkerScope::enter("q");
        assert!(is_reentrant("q"));
        assert!(!is_reentrant("other"));
        drop(scope);
        assert!(!is_reentrant("q"));
    }

    #[test]
    fn test_drain_and_remove() {
        let c = BlockingContainer::new("q", None);
        for id in ["a", "b", "c", "d"] {
            c.put(work(id));
        }
        assert!(c.remove("b").is_some());
        assert!(c.remove("zz").is_none());
        let drained = c.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, "a");
        assert_eq!(drained[1].id, "c");
        assert_eq!(c.len(), 1);
    }
}
