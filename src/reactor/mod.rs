//! The reactor: a single-threaded event loop multiplexing descriptor
//! readiness, timers, and deferred tasks.
//!
//! # Cycle
//!
//! Each iteration of [`Reactor::run`]:
//!
//! 1. caches `now` from the OS clock;
//! 2. computes the multiplex timeout: time to the earliest timer deadline,
//!    capped at [`ReactorConfig::max_sleep`], zero if deferred tasks are
//!    pending, clamped below at `min_sleep`;
//! 3. blocks in the OS multiplex call (select or epoll — see
//!    [`Backend`]); `EINTR` is retried, any other failure drops all
//!    registrations and returns from `run`;
//! 4. dispatches ready `(fd, condition)` pairs to their actions, read
//!    before write before exception per fd; a pair unregistered during
//!    dispatch is skipped for the rest of the cycle, re-registering
//!    replaces the action;
//! 5. drains the deferred-task queue from a snapshot (tasks enqueued while
//!    draining run next cycle);
//! 6. fires every timer due at the cached `now`;
//! 7. invokes the end-of-cycle hook;
//! 8. checks the stop flag and the `max_duration` bound.
//!
//! # Threading
//!
//! A reactor is `!Send`: everything it owns is mutated from the thread that
//! runs it, which the type system enforces. The two cross-thread escape
//! hatches are [`Stopper`] (an atomic stop flag) and
//! [`Performer`](crate::performer::Performer) (queue + self-pipe). Note a
//! stop requested from a foreign thread takes effect at the next wakeup —
//! pair it with a performer when it must be prompt.

pub mod interest;
pub(crate) mod poller;

pub use interest::Interest;
pub use poller::Backend;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::ReactorConfig;
use crate::time::{fire_due, Clock, TimerHandle, TimerQueue};
use poller::{PollEvent, Poller};

static NEXT_REACTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the reactor currently running on this thread (0 = none).
    static CURRENT_REACTOR: Cell<u64> = const { Cell::new(0) };
}

/// Id of the reactor running on the calling thread, or 0.
pub(crate) fn current_reactor_id() -> u64 {
    CURRENT_REACTOR.get()
}

/// Action invoked on descriptor readiness; receives the ready condition.
type FdAction = Box<dyn FnMut(Interest)>;

/// Per-(fd, condition) action slot.
///
/// `InFlight` marks an action taken out for dispatch. If the action is
/// still in flight when dispatch returns, it is restored; if the callback
/// unregistered the pair (slot became `Vacant`) or replaced it (slot became
/// `Occupied` again), the old action is dropped instead.
enum ActionSlot {
    Vacant,
    Occupied(FdAction),
    InFlight,
}

impl ActionSlot {
    fn is_present(&self) -> bool {
        !matches!(self, Self::Vacant)
    }
}

struct FdEntry {
    read: ActionSlot,
    write: ActionSlot,
    except: ActionSlot,
}

impl FdEntry {
    fn new() -> Self {
        Self {
            read: ActionSlot::Vacant,
            write: ActionSlot::Vacant,
            except: ActionSlot::Vacant,
        }
    }

    fn slot_mut(&mut self, condition: Interest) -> &mut ActionSlot {
        if condition.is_readable() {
            &mut self.read
        } else if condition.is_writable() {
            &mut self.write
        } else {
            &mut self.except
        }
    }

    /// Conditions currently registered (in-flight actions count).
    fn interest(&self) -> Interest {
        let mut interest = Interest::NONE;
        if self.read.is_present() {
            interest = interest.add(Interest::READABLE);
        }
        if self.write.is_present() {
            interest = interest.add(Interest::WRITABLE);
        }
        if self.except.is_present() {
            interest = interest.add(Interest::EXCEPTION);
        }
        interest
    }
}

struct Inner {
    id: u64,
    config: ReactorConfig,
    poller: RefCell<Box<dyn Poller>>,
    fds: RefCell<BTreeMap<RawFd, FdEntry>>,
    timers: Rc<RefCell<TimerQueue>>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    clock: Clock,
    stop: Arc<AtomicBool>,
    running: Cell<bool>,
    on_every_cycle: RefCell<Option<Box<dyn FnMut()>>>,
}

/// A cheap, clonable handle to a single-threaded event loop.
///
/// All clones refer to the same loop. The reactor never closes descriptors
/// it did not open; registered fds remain owned by their registrants.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Creates a reactor with the platform-default backend and default
    /// configuration.
    pub fn new() -> io::Result<Self> {
        Self::with_backend(Backend::default(), ReactorConfig::default())
    }

    /// Creates a reactor with the platform-default backend.
    pub fn with_config(config: ReactorConfig) -> io::Result<Self> {
        Self::with_backend(Backend::default(), config)
    }

    /// Creates a reactor with an explicit multiplex backend.
    pub fn with_backend(backend: Backend, config: ReactorConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let poller = backend.build(config.event_batch)?;
        Ok(Self {
            inner: Rc::new(Inner {
                id: NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed),
                config,
                poller: RefCell::new(poller),
                fds: RefCell::new(BTreeMap::new()),
                timers: Rc::new(RefCell::new(TimerQueue::new())),
                deferred: RefCell::new(VecDeque::new()),
                clock: Clock::new(),
                stop: Arc::new(AtomicBool::new(false)),
                running: Cell::new(false),
                on_every_cycle: RefCell::new(None),
            }),
        })
    }

    /// Schedules a timer at an absolute deadline.
    ///
    /// `interval` of zero makes the timer one-shot. With `catchup` set, a
    /// recurring timer that falls behind realigns to the next future phase
    /// multiple of its interval; without it, consecutive deadlines always
    /// differ by exactly `interval`.
    pub fn schedule(
        &self,
        deadline: Instant,
        interval: Duration,
        catchup: bool,
        action: impl FnMut(Instant) + 'static,
    ) -> TimerHandle {
        let state =
            self.inner
                .timers
                .borrow_mut()
                .schedule(deadline, interval, catchup, Box::new(action));
        TimerHandle::new(state, &self.inner.timers)
    }

    /// Schedules a timer `delta` from now.
    pub fn schedule_rel(
        &self,
        delta: Duration,
        interval: Duration,
        catchup: bool,
        action: impl FnMut(Instant) + 'static,
    ) -> TimerHandle {
        self.schedule(self.now() + delta, interval, catchup, action)
    }

    /// Enqueues a task to run in the next cycle's deferred-task drain.
    ///
    /// Tasks enqueued from a single thread run in enqueue order.
    pub fn do_later(&self, task: impl FnOnce() + 'static) {
        self.inner.deferred.borrow_mut().push_back(Box::new(task));
    }

    /// Registers `action` for each condition in `interest` on `fd`.
    ///
    /// Registering a `(fd, condition)` pair that already has an action
    /// replaces it. The action receives the condition that fired. The fd
    /// stays owned by the caller.
    pub fn register_descriptor(
        &self,
        fd: RawFd,
        interest: Interest,
        action: impl FnMut(Interest) + 'static,
    ) -> io::Result<()> {
        if interest.is_empty() {
            return Ok(());
        }
        trace!(fd, ?interest, "register descriptor");
        let shared: Rc<RefCell<dyn FnMut(Interest)>> = Rc::new(RefCell::new(action));
        {
            let mut fds = self.inner.fds.borrow_mut();
            let entry = fds.entry(fd).or_insert_with(FdEntry::new);
            for condition in Interest::DISPATCH_ORDER {
                if interest.contains(condition) {
                    let shared = Rc::clone(&shared);
                    *entry.slot_mut(condition) =
                        ActionSlot::Occupied(Box::new(move |c| (shared.borrow_mut())(c)));
                }
            }
        }
        self.sync_poller(fd)
    }

    /// Removes the actions for each condition in `interest` on `fd`.
    /// Unregistering a condition that is not registered is a no-op.
    pub fn unregister_descriptor(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        {
            let mut fds = self.inner.fds.borrow_mut();
            let Some(entry) = fds.get_mut(&fd) else {
                return Ok(());
            };
            for condition in Interest::DISPATCH_ORDER {
                if interest.contains(condition) {
                    *entry.slot_mut(condition) = ActionSlot::Vacant;
                }
            }
        }
        self.sync_poller(fd)
    }

    /// Removes every action registered on `fd`.
    pub fn unregister_fd(&self, fd: RawFd) -> io::Result<()> {
        self.unregister_descriptor(
            fd,
            Interest::READABLE | Interest::WRITABLE | Interest::EXCEPTION,
        )
    }

    /// Pushes the registry's current interest for `fd` down to the poller,
    /// dropping the map entry once nothing is registered.
    fn sync_poller(&self, fd: RawFd) -> io::Result<()> {
        let interest = {
            let mut fds = self.inner.fds.borrow_mut();
            match fds.get(&fd) {
                None => Interest::NONE,
                Some(entry) => {
                    let interest = entry.interest();
                    if interest.is_empty() {
                        fds.remove(&fd);
                    }
                    interest
                }
            }
        };
        self.inner.poller.borrow_mut().update(fd, interest)
    }

    /// Runs the loop until [`stop`](Self::stop) or `max_duration` elapses.
    ///
    /// `min_sleep` clamps the multiplex timeout from below, trading timer
    /// precision for fewer wakeups.
    ///
    /// # Errors
    ///
    /// Returns the error of an unrecoverable multiplex failure; all
    /// descriptor registrations are dropped first. `EINTR` never surfaces.
    ///
    /// # Panics
    ///
    /// Panics if the reactor is already running.
    pub fn run(
        &self,
        max_duration: Option<Duration>,
        min_sleep: Option<Duration>,
    ) -> io::Result<()> {
        assert!(!self.inner.running.get(), "reactor is already running");
        let _guard = RunGuard::enter(&self.inner);

        let hard_deadline = max_duration.map(|d| Instant::now() + d);
        let mut events: Vec<PollEvent> = Vec::with_capacity(self.inner.config.event_batch);

        loop {
            if self.inner.stop.load(Ordering::Acquire) {
                break;
            }
            let now = self.inner.clock.refresh();
            if let Some(cap) = hard_deadline {
                if now >= cap {
                    break;
                }
            }

            let mut sleep = match self.inner.timers.borrow().next_deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(now)
                    .min(self.inner.config.max_sleep),
                None => self.inner.config.max_sleep,
            };
            if !self.inner.deferred.borrow().is_empty() {
                sleep = Duration::ZERO;
            }
            if let Some(cap) = hard_deadline {
                sleep = sleep.min(cap.saturating_duration_since(now));
            }
            if let Some(min) = min_sleep {
                sleep = sleep.max(min);
            }

            // Snapshot now so that tasks deferred by this cycle's
            // callbacks, drain, or timer firings wait for the next cycle.
            let tasks = mem::take(&mut *self.inner.deferred.borrow_mut());

            events.clear();
            if let Err(err) = self.inner.poller.borrow_mut().poll(&mut events, sleep) {
                debug!(error = %err, "multiplex failed, dropping all registrations");
                self.drop_all_registrations();
                return Err(err);
            }

            for ev in &events {
                self.dispatch_event(*ev);
            }

            for task in tasks {
                task();
            }

            fire_due(&self.inner.timers, self.inner.clock.cached());

            let hook = self.inner.on_every_cycle.borrow_mut().take();
            if let Some(mut hook) = hook {
                hook();
                let mut slot = self.inner.on_every_cycle.borrow_mut();
                if slot.is_none() {
                    *slot = Some(hook);
                }
            }
        }
        Ok(())
    }

    /// Dispatches one readiness event, honoring unregister/replace
    /// performed by the actions themselves.
    fn dispatch_event(&self, ev: PollEvent) {
        for condition in Interest::DISPATCH_ORDER {
            if !ev.ready.contains(condition) {
                continue;
            }
            let taken = {
                let mut fds = self.inner.fds.borrow_mut();
                match fds.get_mut(&ev.fd) {
                    None => None,
                    Some(entry) => {
                        let slot = entry.slot_mut(condition);
                        if slot.is_present() && !matches!(slot, ActionSlot::InFlight) {
                            match mem::replace(slot, ActionSlot::InFlight) {
                                ActionSlot::Occupied(action) => Some(action),
                                _ => None,
                            }
                        } else {
                            None
                        }
                    }
                }
            };
            let Some(mut action) = taken else {
                continue;
            };
            trace!(fd = ev.fd, ?condition, "dispatch");
            action(condition);
            let mut fds = self.inner.fds.borrow_mut();
            if let Some(entry) = fds.get_mut(&ev.fd) {
                let slot = entry.slot_mut(condition);
                if matches!(slot, ActionSlot::InFlight) {
                    *slot = ActionSlot::Occupied(action);
                }
            }
        }
    }

    /// Requests the loop stop at the end of the current cycle.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
    }

    /// Returns a clonable, `Send` handle that can request a stop from any
    /// thread. The request is noticed at the reactor's next wakeup.
    #[must_use]
    pub fn stopper(&self) -> Stopper {
        Stopper {
            flag: Arc::clone(&self.inner.stop),
        }
    }

    /// The current time, cached within a cycle when called from the running
    /// reactor thread; a fresh sample otherwise.
    #[must_use]
    pub fn now(&self) -> Instant {
        if self.is_running_in_this_thread() {
            self.inner.clock.cached()
        } else {
            self.inner.clock.uncached()
        }
    }

    /// A fresh OS clock sample, bypassing the cycle cache.
    #[must_use]
    pub fn now_uncached(&self) -> Instant {
        self.inner.clock.uncached()
    }

    /// Returns true when called from the thread currently inside
    /// [`run`](Self::run).
    #[must_use]
    pub fn is_running_in_this_thread(&self) -> bool {
        current_reactor_id() == self.inner.id
    }

    /// Installs the end-of-cycle hook, replacing any previous one.
    pub fn set_on_every_cycle(&self, hook: impl FnMut() + 'static) {
        *self.inner.on_every_cycle.borrow_mut() = Some(Box::new(hook));
    }

    /// Removes the end-of-cycle hook.
    pub fn clear_on_every_cycle(&self) {
        *self.inner.on_every_cycle.borrow_mut() = None;
    }

    /// Drops every timer, descriptor registration, and deferred task.
    pub fn clear(&self) {
        self.drop_all_registrations();
        self.inner.timers.borrow_mut().clear();
        self.inner.deferred.borrow_mut().clear();
    }

    fn drop_all_registrations(&self) {
        let fds: Vec<RawFd> = self.inner.fds.borrow().keys().copied().collect();
        self.inner.fds.borrow_mut().clear();
        let mut poller = self.inner.poller.borrow_mut();
        for fd in fds {
            let _ = poller.update(fd, Interest::NONE);
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.inner.id)
            .field("running", &self.inner.running.get())
            .field("registered_fds", &self.inner.fds.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Marks the thread-local current reactor for the duration of a `run`,
/// and consumes the stop request on the way out.
struct RunGuard<'a> {
    inner: &'a Inner,
}

impl<'a> RunGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.running.set(true);
        CURRENT_REACTOR.set(inner.id);
        Self { inner }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.inner.running.set(false);
        self.inner.stop.store(false, Ordering::Release);
        CURRENT_REACTOR.set(0);
    }
}

/// Cross-thread stop request for a [`Reactor`].
///
/// A stop requested while the reactor is not running causes the next `run`
/// to return immediately.
#[derive(Clone, Debug)]
pub struct Stopper {
    flag: Arc<AtomicBool>,
}

impl Stopper {
    /// Sets the stop flag. The reactor notices at its next wakeup, which is
    /// at most `max_sleep` away.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }
}
