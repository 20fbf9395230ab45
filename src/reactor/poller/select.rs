//! `select(2)` multiplex flavor.
//!
//! Interest lives in a sorted map; the three `fd_set`s are rebuilt from it
//! on every poll, and the map's largest key is `nfds - 1`. This is the
//! portable flavor — adequate while the highest registered fd stays small,
//! and the only one whose timeout has microsecond resolution.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{PollEvent, Poller};
use crate::reactor::Interest;

pub(crate) struct SelectPoller {
    interest: BTreeMap<RawFd, Interest>,
}

impl SelectPoller {
    pub(crate) fn new() -> Self {
        Self {
            interest: BTreeMap::new(),
        }
    }
}

impl Poller for SelectPoller {
    fn update(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.is_empty() {
            self.interest.remove(&fd);
            return Ok(());
        }
        if fd < 0 || fd >= libc::FD_SETSIZE as RawFd {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fd out of range for select",
            ));
        }
        self.interest.insert(fd, interest);
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Duration) -> io::Result<usize> {
        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut except_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut except_set);
        }

        let mut nfds: RawFd = 0;
        for (&fd, &interest) in &self.interest {
            if interest.is_readable() {
                unsafe { libc::FD_SET(fd, &mut read_set) };
            }
            if interest.is_writable() {
                unsafe { libc::FD_SET(fd, &mut write_set) };
            }
            if interest.is_exception() {
                unsafe { libc::FD_SET(fd, &mut except_set) };
            }
            nfds = fd + 1;
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs().min(i32::MAX as u64) as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let n = unsafe {
            libc::select(
                nfds,
                &mut read_set,
                &mut write_set,
                &mut except_set,
                &mut tv,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut count = 0;
        for (&fd, &interest) in &self.interest {
            let mut ready = Interest::NONE;
            if interest.is_readable() && unsafe { libc::FD_ISSET(fd, &read_set) } {
                ready = ready.add(Interest::READABLE);
            }
            if interest.is_writable() && unsafe { libc::FD_ISSET(fd, &write_set) } {
                ready = ready.add(Interest::WRITABLE);
            }
            if interest.is_exception() && unsafe { libc::FD_ISSET(fd, &except_set) } {
                ready = ready.add(Interest::EXCEPTION);
            }
            if !ready.is_empty() {
                events.push(PollEvent { fd, ready });
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn rejects_out_of_range_fd() {
        let mut poller = SelectPoller::new();
        let err = poller
            .update(libc::FD_SETSIZE as RawFd, Interest::READABLE)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn empty_interest_removes() {
        let mut poller = SelectPoller::new();
        poller.update(0, Interest::READABLE).unwrap();
        poller.update(0, Interest::NONE).unwrap();
        assert!(poller.interest.is_empty());
    }

    #[test]
    fn reports_readable_socket() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        let mut poller = SelectPoller::new();
        poller.update(b.as_raw_fd(), Interest::READABLE).unwrap();

        let mut events = Vec::new();
        let n = poller.poll(&mut events, Duration::from_millis(10)).unwrap();
        assert_eq!(n, 0);

        a.write_all(b"x").unwrap();
        events.clear();
        let n = poller.poll(&mut events, Duration::from_millis(500)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fd, b.as_raw_fd());
        assert!(events[0].ready.is_readable());
    }

    #[test]
    fn reports_writable_socket() {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        let mut poller = SelectPoller::new();
        poller.update(a.as_raw_fd(), Interest::both()).unwrap();

        let mut events = Vec::new();
        let n = poller.poll(&mut events, Duration::from_millis(500)).unwrap();
        assert_eq!(n, 1);
        assert!(events[0].ready.is_writable());
        assert!(!events[0].ready.is_readable());
    }

    #[test]
    fn timeout_with_no_registrations_sleeps() {
        let mut poller = SelectPoller::new();
        let mut events = Vec::new();
        let start = std::time::Instant::now();
        let n = poller.poll(&mut events, Duration::from_millis(30)).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
