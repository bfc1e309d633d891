//! Delayed callbacks and a monotonic clock.
//!
//! Every timer in the client (request timeouts, heartbeats, reconnect and
//! rejoin backoff, teardown polling) is armed through a [`Scheduler`].
//! [`ManualScheduler`] runs on virtual time and is driven explicitly with
//! [`ManualScheduler::advance`]; [`TokioScheduler`] spawns local tasks on
//! the current `LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Runs callbacks after a delay.
pub trait Scheduler {
    /// Run `callback` once after `delay`.
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId;

    /// Cancel a callback. Unknown or already fired ids are ignored.
    fn clear_timeout(&self, id: TimerId);

    /// Time elapsed since the scheduler was created.
    fn now(&self) -> Duration;
}

/// A scheduler on virtual time.
///
/// Nothing fires until [`advance`](Self::advance) moves the clock. Callbacks
/// due at the same instant fire in the order they were scheduled, and
/// callbacks scheduled while advancing fire in the same pass if they fall
/// due before the target time.
#[derive(Default)]
pub struct ManualScheduler {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    queue: RefCell<BTreeMap<(Duration, u64), Box<dyn FnOnce()>>>,
}

impl ManualScheduler {
    /// Create a scheduler at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `by`, firing every callback that falls due.
    pub fn advance(&self, by: Duration) {
        let target = self.now.get() + by;

        loop {
            let next = {
                let mut queue = self.queue.borrow_mut();
                match queue.first_key_value() {
                    Some((&(deadline, _), _)) if deadline <= target => queue.pop_first(),
                    _ => None,
                }
            };

            let Some(((deadline, id), callback)) = next else {
                break;
            };
            if deadline > self.now.get() {
                self.now.set(deadline);
            }
            trace!(timer = id, at_ms = deadline.as_millis() as u64, "Firing timer");
            callback();
        }

        self.now.set(target);
    }

    /// Number of callbacks waiting to fire.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Deadline of the next callback, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.borrow().keys().next().map(|(deadline, _)| *deadline)
    }
}

impl Scheduler for ManualScheduler {
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.queue
            .borrow_mut()
            .insert((self.now.get() + delay, id), callback);
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        // The callback may own the last reference to something whose drop
        // touches this scheduler, so it is dropped after the borrow ends.
        let removed = {
            let mut queue = self.queue.borrow_mut();
            let key = queue.keys().find(|(_, queued)| *queued == id.0).copied();
            key.and_then(|key| queue.remove(&key))
        };
        drop(removed);
    }

    fn now(&self) -> Duration {
        self.now.get()
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.now.get())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// A scheduler backed by tokio timers.
///
/// Must be used from inside a `tokio::task::LocalSet`.
pub struct TokioScheduler {
    start: tokio::time::Instant,
    next_id: Cell<u64>,
    handles: Rc<RefCell<HashMap<u64, JoinHandle<()>>>>,
}

impl TokioScheduler {
    /// Create a scheduler whose clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
            next_id: Cell::new(0),
            handles: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);

        let handles = Rc::downgrade(&self.handles);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(handles) = handles.upgrade() {
                handles.borrow_mut().remove(&id);
            }
            callback();
        });
        self.handles.borrow_mut().insert(id, handle);
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        let handle = self.handles.borrow_mut().remove(&id.0);
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn now(&self) -> Duration {
        tokio::time::Instant::now() - self.start
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.handles.borrow_mut().drain() {
            handle.abort();
        }
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("pending", &self.handles.borrow().len())
            .finish()
    }
}
