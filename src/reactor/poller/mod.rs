//! OS multiplex backends.
//!
//! A [`Poller`] owns the kernel-facing half of descriptor readiness: the
//! reactor tells it the current interest set per fd via [`Poller::update`],
//! and blocks in [`Poller::poll`] once per cycle. Two flavors exist behind
//! the one trait:
//!
//! | Backend | Mechanism | Notes |
//! |---------|-----------|-------|
//! | [`Backend::Select`] | `select(2)` | interest kept in a sorted map; `fd_set`s rebuilt each cycle; fds must be below `FD_SETSIZE` |
//! | [`Backend::Epoll`] | `epoll(7)` | kernel set maintained incrementally; bounded event batch per cycle; Linux only |
//!
//! Both are level-triggered: a condition that stays ready is reported again
//! next cycle. `EINTR` is absorbed by returning an empty batch, so the
//! reactor naturally recomputes its timeout and retries.

#[cfg(target_os = "linux")]
pub(crate) mod epoll;
pub(crate) mod select;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::Interest;

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    /// The ready descriptor.
    pub fd: RawFd,
    /// Which conditions are ready.
    pub ready: Interest,
}

/// A kernel readiness multiplexer.
pub(crate) trait Poller {
    /// Sets the monitored conditions for `fd`. An empty interest removes
    /// the descriptor from the set entirely.
    fn update(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Blocks until a monitored descriptor is ready or `timeout` elapses,
    /// appending readiness into `events`. Returns the number of ready
    /// descriptors; `EINTR` yields `Ok(0)`.
    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Duration) -> io::Result<usize>;
}

/// Which multiplex flavor a reactor uses, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `select(2)`: portable, suitable while the highest fd is small.
    Select,
    /// `epoll(7)`: Linux; constant-time readiness regardless of fd count.
    #[cfg(target_os = "linux")]
    Epoll,
}

impl Default for Backend {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::Epoll
    }

    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Select
    }
}

impl Backend {
    /// Builds the poller for this backend. `batch` bounds the events
    /// delivered per cycle (epoll only).
    pub(crate) fn build(self, batch: usize) -> io::Result<Box<dyn Poller>> {
        match self {
            Self::Select => {
                let _ = batch;
                Ok(Box::new(select::SelectPoller::new()))
            }
            #[cfg(target_os = "linux")]
            Self::Epoll => Ok(Box::new(epoll::EpollPoller::new(batch)?)),
        }
    }
}
