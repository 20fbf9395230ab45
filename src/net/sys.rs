//! Thin fd-level syscall wrappers.
//!
//! Everything unsafe about raw descriptors in this crate lives here or in
//! `reactor::poller`. Each wrapper maps the C return convention onto
//! `io::Result` and nothing else.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

#[cfg(not(target_os = "macos"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(target_os = "macos")]
const SEND_FLAGS: libc::c_int = 0; // SO_NOSIGPIPE is set at attach instead.

fn cvt(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Creates a pipe with both ends non-blocking and close-on-exec.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [fds[0], fds[1]] {
        set_nonblocking(fd)?;
        set_cloexec(fd)?;
    }
    Ok((read, write))
}

/// Sets `FD_CLOEXEC` via fcntl.
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sets `O_NONBLOCK` via fcntl.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sets `TCP_NOTSENT_LOWAT`, bounding unsent kernel-buffered bytes.
#[cfg(target_os = "linux")]
pub(crate) fn set_notsent_lowat(fd: RawFd, bytes: usize) -> io::Result<()> {
    let value = bytes.min(libc::c_int::MAX as usize) as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NOTSENT_LOWAT,
            std::ptr::addr_of!(value).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_notsent_lowat(_fd: RawFd, _bytes: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP_NOTSENT_LOWAT not available",
    ))
}

/// Suppresses `SIGPIPE` at the socket level where sends cannot carry
/// `MSG_NOSIGNAL`.
#[cfg(target_os = "macos")]
pub(crate) fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let value: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            std::ptr::addr_of!(value).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking receive into `buf`.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt(unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) })
}

/// Non-blocking send of `buf`, with `SIGPIPE` suppressed.
pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt(unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), SEND_FLAGS) })
}

/// Writes the single wake byte to a pipe.
pub(crate) fn write_wake_byte(fd: RawFd) -> io::Result<()> {
    let byte = [1u8];
    let n = cvt(unsafe { libc::write(fd, byte.as_ptr().cast(), 1) })?;
    if n != 1 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "wake byte not written",
        ));
    }
    Ok(())
}

/// Drains any pending wake bytes from a pipe's read end.
pub(crate) fn drain_wake_bytes(fd: RawFd) {
    let mut buf = [0u8; 16];
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if ret <= 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_is_nonblocking() {
        let (read, write) = pipe().unwrap();
        // Reading an empty pipe must not block.
        let mut buf = [0u8; 1];
        let ret = unsafe { libc::read(read.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        assert!(ret < 0);
        assert_eq!(
            io::Error::last_os_error().kind(),
            io::ErrorKind::WouldBlock
        );

        write_wake_byte(write.as_raw_fd()).unwrap();
        let ret = unsafe { libc::read(read.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        assert_eq!(ret, 1);
    }

    #[test]
    fn drain_consumes_everything() {
        let (read, write) = pipe().unwrap();
        for _ in 0..5 {
            write_wake_byte(write.as_raw_fd()).unwrap();
        }
        drain_wake_bytes(read.as_raw_fd());

        let mut buf = [0u8; 1];
        let ret = unsafe { libc::read(read.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        assert!(ret < 0, "pipe should be empty after drain");
    }

    #[test]
    fn send_recv_roundtrip() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        assert_eq!(send(a.as_raw_fd(), b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(recv(b.as_raw_fd(), &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        // Empty socket reports WouldBlock.
        let err = recv(b.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
