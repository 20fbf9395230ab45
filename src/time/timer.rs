//! Deadline-ordered timers with recurrence and catch-up.
//!
//! Timers live in a [`TimerQueue`] sorted by `(deadline, sequence)`. The
//! sequence number is assigned at insertion and makes same-deadline firing
//! order FIFO — a plain deadline heap is not enough, because the relative
//! order of two timers scheduled for the same tick is observable.
//!
//! Recurrence arithmetic is integer microseconds throughout. A recurring
//! timer has two lateness policies:
//!
//! - `catchup = false`: the next deadline is always `previous + interval`,
//!   so consecutive deadlines keep a fixed delta no matter how late the
//!   previous firing ran.
//! - `catchup = true`: after a stall longer than one interval, the deadline
//!   advances to the nearest phase-aligned multiple of the interval that
//!   lies strictly in the future.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use super::MIN_INTERVAL;

/// Callback invoked when a timer fires; receives the cycle's cached `now`.
pub(crate) type TimerAction = Box<dyn FnMut(Instant)>;

/// Sort key while a timer is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: Instant,
    seq: u64,
}

/// Shared mutable timer state, referenced by the queue and by handles.
pub(crate) struct TimerState {
    deadline: Instant,
    interval: Duration,
    catchup: bool,
    action: Option<TimerAction>,
    canceled: bool,
    firing: bool,
    rescheduled: bool,
    /// Present iff the timer currently sits in the queue.
    queued_at: Option<TimerKey>,
}

type SharedTimer = Rc<RefCell<TimerState>>;

/// Ordered collection of pending timers.
pub(crate) struct TimerQueue {
    entries: BTreeMap<TimerKey, SharedTimer>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Creates a timer and inserts it.
    pub(crate) fn schedule(
        &mut self,
        deadline: Instant,
        interval: Duration,
        catchup: bool,
        action: TimerAction,
    ) -> SharedTimer {
        let timer = Rc::new(RefCell::new(TimerState {
            deadline,
            interval: clamp_interval(interval),
            catchup,
            action: Some(action),
            canceled: false,
            firing: false,
            rescheduled: false,
            queued_at: None,
        }));
        self.insert(&timer);
        timer
    }

    /// Inserts a timer at its current deadline with a fresh sequence number.
    fn insert(&mut self, timer: &SharedTimer) {
        let key = TimerKey {
            deadline: timer.borrow().deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        timer.borrow_mut().queued_at = Some(key);
        self.entries.insert(key, Rc::clone(timer));
    }

    /// Removes a timer by identity, if queued.
    fn remove(&mut self, timer: &SharedTimer) {
        if let Some(key) = timer.borrow_mut().queued_at.take() {
            self.entries.remove(&key);
        }
    }

    /// Deadline of the earliest pending timer.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|k| k.deadline)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancels and drops every queued timer.
    pub(crate) fn clear(&mut self) {
        for timer in self.entries.values() {
            let mut state = timer.borrow_mut();
            state.canceled = true;
            state.queued_at = None;
        }
        self.entries.clear();
    }
}

/// Fires every timer whose deadline is at or before `now`, in key order.
///
/// The queue borrow is released around each action invocation, so an action
/// may cancel or reschedule any timer (including itself) and may schedule
/// new ones. A timer inserted during the drain fires in the same drain iff
/// its deadline is `<= now`.
pub(crate) fn fire_due(queue: &Rc<RefCell<TimerQueue>>, now: Instant) {
    loop {
        let timer = {
            let mut q = queue.borrow_mut();
            let due = q
                .entries
                .first_key_value()
                .is_some_and(|(key, _)| key.deadline <= now);
            if !due {
                break;
            }
            let (_, timer) = q.entries.pop_first().expect("checked non-empty");
            timer.borrow_mut().queued_at = None;
            timer
        };

        let mut action = {
            let mut state = timer.borrow_mut();
            state.firing = true;
            state.rescheduled = false;
            state.action.take()
        };
        if let Some(f) = action.as_mut() {
            f(now);
        }

        let mut state = timer.borrow_mut();
        state.firing = false;
        state.action = action;

        if state.canceled {
            continue;
        }
        if state.rescheduled {
            // The action moved the deadline explicitly; no recurrence math.
            drop(state);
            queue.borrow_mut().insert(&timer);
            continue;
        }
        if state.interval > Duration::ZERO {
            state.deadline = next_recurrence(state.deadline, state.interval, state.catchup, now);
            drop(state);
            queue.borrow_mut().insert(&timer);
        } else {
            // A retired one-shot behaves as canceled.
            state.canceled = true;
        }
    }
}

/// Computes the deadline of the next recurrence after a firing at `now`.
fn next_recurrence(deadline: Instant, interval: Duration, catchup: bool, now: Instant) -> Instant {
    if catchup && now > deadline + interval {
        // Skip to the first phase-aligned point strictly after `now`:
        // deadline + k*interval with k = floor((now - deadline)/interval) + 1,
        // computed as now + interval - ((now - deadline) mod interval).
        let behind = now - deadline;
        let rem_micros = behind.as_micros() % interval.as_micros();
        now + interval - Duration::from_micros(rem_micros as u64)
    } else {
        deadline + interval
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    if interval > Duration::ZERO && interval < MIN_INTERVAL {
        MIN_INTERVAL
    } else {
        interval
    }
}

/// The caller's grip on a scheduled timer.
///
/// Handles are cheap to clone and may outlive the firing; all mutation must
/// happen on the reactor thread (handles are not `Send`). Dropping every
/// handle does not cancel the timer — the reactor's queue keeps it alive
/// until it retires or is canceled.
#[derive(Clone)]
pub struct TimerHandle {
    state: SharedTimer,
    queue: Weak<RefCell<TimerQueue>>,
}

impl TimerHandle {
    pub(crate) fn new(state: SharedTimer, queue: &Rc<RefCell<TimerQueue>>) -> Self {
        Self {
            state,
            queue: Rc::downgrade(queue),
        }
    }

    /// Cancels the timer. Canceling during the timer's own firing prevents
    /// its reinsertion; canceling a canceled timer is a no-op.
    pub fn cancel(&self) {
        let key = {
            let mut state = self.state.borrow_mut();
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.queued_at.take()
        };
        if let (Some(key), Some(queue)) = (key, self.queue.upgrade()) {
            queue.borrow_mut().entries.remove(&key);
        }
    }

    /// Returns true if the timer was canceled or has retired.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state.borrow().canceled
    }

    /// Moves the deadline. During the timer's own firing this defers: the
    /// new deadline takes effect when the firing completes, replacing the
    /// recurrence computation. No-op on a canceled timer.
    pub fn set_next_fire_time(&self, when: Instant) {
        let requeue = {
            let mut state = self.state.borrow_mut();
            if state.canceled {
                return;
            }
            if state.firing {
                state.deadline = when;
                state.rescheduled = true;
                return;
            }
            state.deadline = when;
            state.queued_at.take()
        };
        if let Some(queue) = self.queue.upgrade() {
            let mut q = queue.borrow_mut();
            if let Some(key) = requeue {
                q.entries.remove(&key);
            }
            q.insert(&self.state);
        }
    }

    /// Changes the recurrence interval (zero makes the timer one-shot after
    /// its next firing). Takes effect when the next deadline is computed.
    pub fn set_recur_interval(&self, interval: Duration) {
        self.state.borrow_mut().interval = clamp_interval(interval);
    }

    /// Changes the lateness policy for subsequent recurrences.
    pub fn set_catchup(&self, catchup: bool) {
        self.state.borrow_mut().catchup = catchup;
    }

    /// The pending deadline, or `None` once canceled/retired.
    #[must_use]
    pub fn next_fire_time(&self) -> Option<Instant> {
        let state = self.state.borrow();
        if state.canceled {
            None
        } else {
            Some(state.deadline)
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TimerHandle")
            .field("deadline", &state.deadline)
            .field("interval", &state.interval)
            .field("catchup", &state.catchup)
            .field("canceled", &state.canceled)
            .finish()
    }
}
