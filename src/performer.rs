//! Cross-thread dispatch onto a reactor thread.
//!
//! A [`Performer`] pairs a mutex-guarded FIFO with a non-blocking self-pipe
//! whose read end is registered with the reactor. Any thread may enqueue a
//! task; the enqueue writes one wake byte (coalesced — at most one byte is
//! ever outstanding) and the reactor's signal handler drains the queue on
//! the reactor thread.
//!
//! The wake byte is written while the queue mutex is still held, so a
//! reactor that observes the pipe readable always finds at least the item
//! that signaled it. Tasks execute outside the mutex.
//!
//! # Handles
//!
//! [`Performer`] itself stays on the reactor thread (it holds the reactor
//! handle, needed to unregister at [`close`](Performer::close)).
//! [`PerformerHandle`] is the `Send + Clone` face given to worker threads.
//!
//! # Synchronous perform
//!
//! [`perform_sync`](PerformerHandle::perform_sync) blocks the caller until
//! the task has executed on the reactor thread. Called *from* the reactor
//! thread it first drains the queue, then runs the task inline, preserving
//! FIFO order with earlier asynchronous tasks — the alternative is
//! self-deadlock. Two reactor threads performing synchronously into each
//! other can still deadlock; don't build synchronous cycles.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::net::sys;
use crate::reactor::{current_reactor_id, Interest, Reactor};

type Task = Box<dyn FnOnce() + Send>;

/// Completion signal for a synchronous perform.
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

struct Item {
    task: Task,
    completion: Option<Arc<Completion>>,
}

struct Queue {
    items: VecDeque<Item>,
    /// True while a wake byte is outstanding.
    signaled: bool,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    reactor_id: u64,
    /// Kept open until the last handle drops; the `closed` flag stops use
    /// before that.
    write_fd: OwnedFd,
    read_fd: OwnedFd,
}

enum Enqueue {
    Enqueued,
    Rejected,
}

impl Shared {
    /// Enqueues under the mutex; writes the wake byte before unlocking.
    fn enqueue(&self, task: Task, completion: Option<Arc<Completion>>) -> io::Result<Enqueue> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Ok(Enqueue::Rejected);
        }
        queue.items.push_back(Item { task, completion });
        if !queue.signaled {
            queue.signaled = true;
            if let Err(err) = sys::write_wake_byte(self.write_fd.as_raw_fd()) {
                queue.signaled = false;
                queue.items.pop_back();
                return Err(err);
            }
        }
        Ok(Enqueue::Enqueued)
    }

    /// Pops and runs items one at a time, executing outside the mutex.
    fn fire_items(&self) {
        loop {
            let item = self.queue.lock().items.pop_front();
            let Some(item) = item else { break };
            (item.task)();
            if let Some(completion) = item.completion {
                completion.notify();
            }
        }
    }

    /// The reactor-side signal handler.
    fn on_signal(&self) {
        sys::drain_wake_bytes(self.read_fd.as_raw_fd());
        self.queue.lock().signaled = false;
        self.fire_items();
    }

    fn is_reactor_thread(&self) -> bool {
        current_reactor_id() == self.reactor_id
    }

    fn perform(&self, task: Task) -> io::Result<()> {
        // Rejected-after-close is silent by contract.
        self.enqueue(task, None).map(|_| ())
    }

    fn perform_sync(&self, task: Task) -> io::Result<()> {
        if self.is_reactor_thread() {
            // Preserve FIFO with earlier async tasks, then run inline.
            self.fire_items();
            if self.queue.lock().closed {
                return Ok(());
            }
            task();
            return Ok(());
        }
        let completion = Arc::new(Completion::new());
        match self.enqueue(task, Some(Arc::clone(&completion)))? {
            Enqueue::Rejected => Ok(()),
            Enqueue::Enqueued => {
                completion.wait();
                Ok(())
            }
        }
    }
}

/// The reactor-side owner of a cross-thread task queue.
///
/// Create it on the reactor's thread, hand [`PerformerHandle`]s to workers,
/// and [`close`](Self::close) it (or drop it) on the reactor thread when
/// done.
pub struct Performer {
    shared: Arc<Shared>,
    reactor: Reactor,
}

impl Performer {
    /// Creates the self-pipe and registers its read end with `reactor`.
    pub fn new(reactor: &Reactor) -> io::Result<Self> {
        let (read_fd, write_fd) = sys::pipe()?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                signaled: false,
                closed: false,
            }),
            reactor_id: reactor.id(),
            write_fd,
            read_fd,
        });

        let signal_target = Arc::clone(&shared);
        reactor.register_descriptor(
            shared.read_fd.as_raw_fd(),
            Interest::READABLE,
            move |_| signal_target.on_signal(),
        )?;

        Ok(Self {
            shared,
            reactor: reactor.clone(),
        })
    }

    /// Returns a `Send + Clone` handle for worker threads.
    #[must_use]
    pub fn handle(&self) -> PerformerHandle {
        PerformerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Enqueues a fire-and-forget task for the reactor thread.
    ///
    /// After [`close`](Self::close) the task is silently dropped.
    ///
    /// # Errors
    ///
    /// Surfaces a failed wake-byte write; the task is not queued then.
    pub fn perform(&self, task: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.shared.perform(Box::new(task))
    }

    /// Runs `task` on the reactor thread and waits for it to finish.
    pub fn perform_sync(&self, task: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.shared.perform_sync(Box::new(task))
    }

    /// Closes the performer: marks it closed (new performs are rejected
    /// from this point), runs **every** queued task, then unregisters the
    /// pipe from the reactor.
    ///
    /// Must be called on the reactor thread (or before the reactor runs).
    pub fn close(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
        }
        trace!("performer closing, draining queue");
        self.shared.fire_items();
        let _ = self
            .reactor
            .unregister_fd(self.shared.read_fd.as_raw_fd());
    }
}

impl Drop for Performer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Performer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("Performer")
            .field("queued", &queue.items.len())
            .field("closed", &queue.closed)
            .finish_non_exhaustive()
    }
}

/// A `Send + Clone` handle for enqueueing work from any thread.
#[derive(Clone)]
pub struct PerformerHandle {
    shared: Arc<Shared>,
}

impl PerformerHandle {
    /// See [`Performer::perform`].
    pub fn perform(&self, task: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.shared.perform(Box::new(task))
    }

    /// See [`Performer::perform_sync`]. Blocks the calling thread until
    /// the task has run (inline fast path on the reactor thread itself).
    pub fn perform_sync(&self, task: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.shared.perform_sync(Box::new(task))
    }
}

impl std::fmt::Debug for PerformerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformerHandle").finish_non_exhaustive()
    }
}
