//! Retry timer with a caller-supplied backoff schedule.
//!
//! A [`BackoffTimer`] arms at most one pending fire at a time. Each fire
//! bumps the attempt counter before running the callback, so the schedule
//! sees 1 for the first retry, 2 for the second, and so on until
//! [`BackoffTimer::reset`] is called.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tracing::trace;

use crate::timer::{Scheduler, TimerId};

/// Maps an attempt number (starting at 1) to a delay.
pub type BackoffFn = Rc<dyn Fn(u32) -> Duration>;

/// Build a stepped schedule: the n-th attempt waits `steps_ms[n - 1]`
/// milliseconds, and every attempt past the end waits `max_ms`.
#[must_use]
pub fn stepped(steps_ms: &[u64], max_ms: u64) -> BackoffFn {
    let steps = steps_ms.to_vec();
    Rc::new(move |tries: u32| {
        let index = tries.saturating_sub(1) as usize;
        Duration::from_millis(steps.get(index).copied().unwrap_or(max_ms))
    })
}

/// Build a schedule that always waits `delay`.
#[must_use]
pub fn constant(delay: Duration) -> BackoffFn {
    Rc::new(move |_: u32| delay)
}

struct Inner {
    scheduler: Rc<dyn Scheduler>,
    callback: Box<dyn Fn()>,
    timer_calc: BackoffFn,
    tries: Cell<u32>,
    pending: Cell<Option<TimerId>>,
}

impl Inner {
    fn cancel(&self) {
        if let Some(id) = self.pending.take() {
            self.scheduler.clear_timeout(id);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A retry timer.
///
/// Cloning yields another handle to the same timer.
#[derive(Clone)]
pub struct BackoffTimer {
    inner: Rc<Inner>,
}

impl BackoffTimer {
    /// Create a timer that runs `callback` on every fire.
    pub fn new(
        scheduler: Rc<dyn Scheduler>,
        timer_calc: BackoffFn,
        callback: impl Fn() + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                scheduler,
                callback: Box::new(callback),
                timer_calc,
                tries: Cell::new(0),
                pending: Cell::new(None),
            }),
        }
    }

    /// Cancel any pending fire and zero the attempt counter.
    pub fn reset(&self) {
        self.inner.tries.set(0);
        self.inner.cancel();
    }

    /// Cancel any pending fire and arm a new one after `calc(tries + 1)`.
    pub fn schedule_timeout(&self) {
        self.inner.cancel();

        let delay = (self.inner.timer_calc)(self.inner.tries.get() + 1);
        trace!(
            tries = self.inner.tries.get(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling backoff timer"
        );

        let weak = Rc::downgrade(&self.inner);
        let id = self.inner.scheduler.set_timeout(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.pending.set(None);
                    inner.tries.set(inner.tries.get() + 1);
                    (inner.callback)();
                }
            }),
        );
        self.inner.pending.set(Some(id));
    }

    /// Number of fires since the last reset.
    #[must_use]
    pub fn tries(&self) -> u32 {
        self.inner.tries.get()
    }

    /// Whether a fire is armed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.pending.get().is_some()
    }
}

impl fmt::Debug for BackoffTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffTimer")
            .field("tries", &self.tries())
            .field("pending", &self.is_pending())
            .finish()
    }
}
