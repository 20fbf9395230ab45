//! `epoll(7)` multiplex flavor (Linux).
//!
//! The kernel interest set is maintained incrementally: every
//! [`Poller::update`] issues the matching `epoll_ctl` operation, so a poll
//! is O(ready) rather than O(registered). `epoll_wait` fills a bounded
//! batch per cycle; descriptors still ready beyond the batch are reported
//! in the next cycle (level-triggered).
//!
//! `EPOLLERR`/`EPOLLHUP` cannot be masked out and are folded into the
//! readable (and writable) conditions, so the owning adapter observes the
//! failure through its ordinary read/write path.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{PollEvent, Poller};
use crate::reactor::Interest;

pub(crate) struct EpollPoller {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
    batch: usize,
}

impl EpollPoller {
    pub(crate) fn new(batch: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            buf: Vec::with_capacity(batch),
            batch,
        })
    }
}

fn interest_to_mask(interest: Interest) -> u32 {
    let mut mask = 0u32;
    if interest.is_readable() {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        mask |= libc::EPOLLOUT as u32;
    }
    if interest.is_exception() {
        mask |= libc::EPOLLPRI as u32;
    }
    mask
}

fn mask_to_ready(mask: u32) -> Interest {
    let mut ready = Interest::NONE;
    let err = mask & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
    if err || mask & libc::EPOLLIN as u32 != 0 {
        ready = ready.add(Interest::READABLE);
    }
    if err || mask & libc::EPOLLOUT as u32 != 0 {
        ready = ready.add(Interest::WRITABLE);
    }
    if mask & libc::EPOLLPRI as u32 != 0 {
        ready = ready.add(Interest::EXCEPTION);
    }
    ready
}

impl Poller for EpollPoller {
    fn update(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.is_empty() {
            let ret = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // Deleting an unknown fd is the no-op unregister case.
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
            return Ok(());
        }

        let mut ev = libc::epoll_event {
            events: interest_to_mask(interest),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err);
        }
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Duration) -> io::Result<usize> {
        // Round up to whole milliseconds so a sub-millisecond timer
        // deadline does not busy-spin.
        let millis = if timeout.is_zero() {
            0
        } else {
            ((timeout.as_micros() + 999) / 1000).min(i32::MAX as u128) as i32
        };

        self.buf.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.buf.as_mut_ptr(),
                self.batch as i32,
                millis,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        let n = n as usize;
        unsafe { self.buf.set_len(n) };

        for ev in &self.buf {
            let fd = ev.u64 as RawFd;
            let ready = mask_to_ready(ev.events);
            if !ready.is_empty() {
                events.push(PollEvent { fd, ready });
            }
        }
        Ok(n)
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
