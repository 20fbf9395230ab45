//! Reactor-bound socket adapter.
//!
//! The adapter owns a non-blocking stream socket and the two buffers
//! around it. Incoming bytes are read once per readable edge (at most one
//! scratch-buffer's worth, keeping cycles fair across connections) and
//! handed to the receive callback as a slice. Outgoing bytes are queued in
//! a byte deque and drained on writable edges under a per-cycle cap, so a
//! fat writer cannot starve the loop.
//!
//! # Lifecycle
//!
//! ```text
//! Detached -- attach --> Open -- shutdown --> ShuttingDown -- drained --> Closed
//!                          \------------------- close / fatal error ----> Closed
//! ```
//!
//! While `Open`, the fd is registered READABLE iff a receive callback is
//! installed and has not returned [`RecvFlow::Stop`], and registered
//! WRITABLE iff the output buffer is non-empty or a writable producer is
//! pending. The close callback runs exactly once.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use tracing::{debug, trace};

use super::{sys, CloseReason};
use crate::config::AdapterConfig;
use crate::reactor::{Interest, Reactor};

/// Receive-callback verdict: keep delivering, or pause reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvFlow {
    /// Keep the readable registration.
    Continue,
    /// Unregister READABLE; reinstalling a receive callback re-arms it.
    Stop,
}

/// Writable-producer verdict: run again on the next edge, or uninstall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFlow {
    /// Invoke the producer again on the next writable edge.
    Keep,
    /// Uninstall the producer.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Detached,
    Open,
    ShuttingDown,
    Closed,
}

struct Inner {
    reactor: Reactor,
    config: AdapterConfig,
    state: State,
    fd: Option<OwnedFd>,
    /// Read scratch; taken out during the read edge as a reentrancy guard.
    scratch: Option<Box<[u8]>>,
    out: VecDeque<u8>,
    on_receive: Option<Box<dyn FnMut(&[u8]) -> RecvFlow>>,
    on_writable: Option<Box<dyn FnMut() -> WriteFlow>>,
    on_close: Option<Box<dyn FnOnce(CloseReason)>>,
    on_shutdown_complete: Option<Box<dyn FnOnce()>>,
    read_registered: bool,
    write_registered: bool,
    recv_stopped: bool,
}

impl Inner {
    fn raw_fd(&self) -> Option<i32> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn is_attached(&self) -> bool {
        matches!(self.state, State::Open | State::ShuttingDown)
    }
}

/// A non-blocking stream socket bound to a [`Reactor`].
///
/// Clones are handles to the same connection. All methods must be called
/// on the reactor's thread (the type is `!Send`).
#[derive(Clone)]
pub struct SocketAdapter {
    inner: Rc<RefCell<Inner>>,
}

impl SocketAdapter {
    /// Creates a detached adapter with default tuning.
    #[must_use]
    pub fn new(reactor: &Reactor) -> Self {
        Self::with_config(reactor, AdapterConfig::default())
    }

    /// Creates a detached adapter with explicit tuning.
    #[must_use]
    pub fn with_config(reactor: &Reactor, config: AdapterConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                reactor: reactor.clone(),
                config,
                state: State::Detached,
                fd: None,
                scratch: None,
                out: VecDeque::new(),
                on_receive: None,
                on_writable: None,
                on_close: None,
                on_shutdown_complete: None,
                read_registered: false,
                write_registered: false,
                recv_stopped: false,
            })),
        }
    }

    /// Takes ownership of a stream socket and binds it to the reactor.
    ///
    /// The socket is made non-blocking; `TCP_NODELAY` and
    /// `TCP_NOTSENT_LOWAT` are applied best-effort (non-TCP sockets simply
    /// do not take them). On macOS, `SO_NOSIGPIPE` replaces the
    /// `MSG_NOSIGNAL` send flag.
    ///
    /// # Errors
    ///
    /// Fails if the adapter is already attached or the socket cannot be
    /// made non-blocking.
    pub fn attach(&self, fd: impl Into<OwnedFd>) -> io::Result<()> {
        let fd = fd.into();
        {
            let mut inner = self.inner.borrow_mut();
            inner
                .config
                .validate()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            if inner.state != State::Detached {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "adapter already attached",
                ));
            }

            let sock = socket2::SockRef::from(&fd);
            sock.set_nonblocking(true)?;
            if let Err(err) = sock.set_nodelay(true) {
                debug!(error = %err, "TCP_NODELAY not applied");
            }
            if let Err(err) = sys::set_notsent_lowat(fd.as_raw_fd(), inner.config.unsent_lowat) {
                debug!(error = %err, "TCP_NOTSENT_LOWAT not applied");
            }
            #[cfg(target_os = "macos")]
            if let Err(err) = sys::set_nosigpipe(fd.as_raw_fd()) {
                debug!(error = %err, "SO_NOSIGPIPE not applied");
            }

            inner.scratch = Some(vec![0u8; inner.config.read_buffer].into_boxed_slice());
            inner.fd = Some(fd);
            inner.state = State::Open;
        }
        self.sync_read_registration()
    }

    /// Installs (or replaces) the receive callback and re-arms reading.
    pub fn set_on_receive(
        &self,
        callback: impl FnMut(&[u8]) -> RecvFlow + 'static,
    ) -> io::Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::Closed {
                return Ok(());
            }
            inner.on_receive = Some(Box::new(callback));
            inner.recv_stopped = false;
        }
        self.sync_read_registration()
    }

    /// Installs the close callback (invoked exactly once, with the reason).
    pub fn set_on_close(&self, callback: impl FnOnce(CloseReason) + 'static) {
        self.inner.borrow_mut().on_close = Some(Box::new(callback));
    }

    /// Installs the callback invoked when a graceful shutdown has drained.
    pub fn set_on_shutdown_complete(&self, callback: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_shutdown_complete = Some(Box::new(callback));
    }

    /// Queues bytes for transmission.
    ///
    /// Returns false (and queues nothing) unless the adapter is open.
    /// Queued bytes are never lost while the adapter stays open: they are
    /// offered to the kernel in order across subsequent writable edges.
    pub fn write_bytes(&self, data: &[u8]) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Open || inner.fd.is_none() {
                return false;
            }
            inner.out.extend(data.iter().copied());
        }
        let _ = self.sync_write_registration();
        true
    }

    /// Installs a writable producer, replacing any pending one.
    ///
    /// The producer runs on each writable edge *before* the buffer drain,
    /// so bytes it writes piggyback on the same send edge. It stays
    /// installed until it returns [`WriteFlow::Stop`]. Returns false
    /// unless the adapter is open.
    pub fn notify_when_writable(&self, producer: impl FnMut() -> WriteFlow + 'static) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Open || inner.fd.is_none() {
                return false;
            }
            inner.on_writable = Some(Box::new(producer));
        }
        let _ = self.sync_write_registration();
        true
    }

    /// Begins a graceful close: no further writes are accepted, queued
    /// bytes drain, then the shutdown-complete callback runs and the
    /// adapter closes with [`CloseReason::Local`].
    pub fn shutdown(&self) {
        let immediate = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Open {
                return;
            }
            inner.state = State::ShuttingDown;
            inner.out.is_empty()
        };
        if immediate {
            self.finish_shutdown();
        } else {
            let _ = self.sync_write_registration();
        }
    }

    /// Closes immediately: unregisters, closes the fd, fires the close
    /// callback with [`CloseReason::Local`]. Queued output is discarded.
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    /// Returns true while the adapter accepts writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.borrow().state == State::Open
    }

    /// Returns true once fully closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().state == State::Closed
    }

    /// Bytes queued but not yet offered to the kernel.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.inner.borrow().out.len()
    }

    fn sync_read_registration(&self) -> io::Result<()> {
        let (want, registered, fd) = {
            let inner = self.inner.borrow();
            let want = inner.is_attached() && inner.on_receive.is_some() && !inner.recv_stopped;
            (want, inner.read_registered, inner.raw_fd())
        };
        let Some(fd) = fd else { return Ok(()) };
        if want == registered {
            return Ok(());
        }
        let reactor = self.inner.borrow().reactor.clone();
        if want {
            let weak = Rc::downgrade(&self.inner);
            reactor.register_descriptor(fd, Interest::READABLE, move |_| {
                if let Some(inner) = weak.upgrade() {
                    SocketAdapter { inner }.handle_readable();
                }
            })?;
        } else {
            reactor.unregister_descriptor(fd, Interest::READABLE)?;
        }
        self.inner.borrow_mut().read_registered = want;
        Ok(())
    }

    fn sync_write_registration(&self) -> io::Result<()> {
        let (want, registered, fd) = {
            let inner = self.inner.borrow();
            let want =
                inner.is_attached() && (!inner.out.is_empty() || inner.on_writable.is_some());
            (want, inner.write_registered, inner.raw_fd())
        };
        let Some(fd) = fd else { return Ok(()) };
        if want == registered {
            return Ok(());
        }
        let reactor = self.inner.borrow().reactor.clone();
        if want {
            let weak = Rc::downgrade(&self.inner);
            reactor.register_descriptor(fd, Interest::WRITABLE, move |_| {
                if let Some(inner) = weak.upgrade() {
                    SocketAdapter { inner }.handle_writable();
                }
            })?;
        } else {
            reactor.unregister_descriptor(fd, Interest::WRITABLE)?;
        }
        self.inner.borrow_mut().write_registered = want;
        Ok(())
    }

    /// Read edge: one bounded read, then deliver.
    fn handle_readable(&self) {
        let (fd, mut scratch) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.is_attached() {
                return;
            }
            let Some(fd) = inner.raw_fd() else { return };
            let Some(scratch) = inner.scratch.take() else {
                return;
            };
            (fd, scratch)
        };

        match sys::recv(fd, &mut scratch) {
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                self.inner.borrow_mut().scratch = Some(scratch);
            }
            Err(err) => {
                self.inner.borrow_mut().scratch = Some(scratch);
                self.close_with(CloseReason::Error(err));
            }
            Ok(0) => {
                self.inner.borrow_mut().scratch = Some(scratch);
                self.close_with(CloseReason::PeerClosed);
            }
            Ok(n) => {
                trace!(fd, bytes = n, "read edge");
                let callback = self.inner.borrow_mut().on_receive.take();
                let flow = match callback {
                    Some(mut callback) => {
                        let flow = callback(&scratch[..n]);
                        let mut inner = self.inner.borrow_mut();
                        inner.scratch = Some(scratch);
                        if inner.state != State::Closed && inner.on_receive.is_none() {
                            inner.on_receive = Some(callback);
                        }
                        flow
                    }
                    None => {
                        self.inner.borrow_mut().scratch = Some(scratch);
                        return;
                    }
                };
                if flow == RecvFlow::Stop {
                    self.inner.borrow_mut().recv_stopped = true;
                    let _ = self.sync_read_registration();
                }
            }
        }
    }

    /// Write edge: producer first, then a capped drain.
    fn handle_writable(&self) {
        let producer = self.inner.borrow_mut().on_writable.take();
        if let Some(mut producer) = producer {
            let flow = producer();
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Closed
                && flow == WriteFlow::Keep
                && inner.on_writable.is_none()
            {
                inner.on_writable = Some(producer);
            }
        }

        let mut fatal = None;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::Closed {
                return;
            }
            if let Some(fd) = inner.raw_fd() {
                if !inner.out.is_empty() {
                    let cap = inner.config.write_cap;
                    let (first, _) = inner.out.as_slices();
                    let attempt = first.len().min(cap);
                    match sys::send(fd, &first[..attempt]) {
                        Ok(sent) => {
                            trace!(fd, bytes = sent, "write edge");
                            inner.out.drain(..sent);
                        }
                        Err(err)
                            if err.kind() == io::ErrorKind::WouldBlock
                                || err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => fatal = Some(err),
                    }
                }
            }
        }
        if let Some(err) = fatal {
            self.close_with(CloseReason::Error(err));
            return;
        }

        let finish = {
            let inner = self.inner.borrow();
            inner.out.is_empty() && inner.state == State::ShuttingDown
        };
        let _ = self.sync_write_registration();
        if finish {
            self.finish_shutdown();
        }
    }

    fn finish_shutdown(&self) {
        let callback = self.inner.borrow_mut().on_shutdown_complete.take();
        if let Some(callback) = callback {
            callback();
        }
        self.close_with(CloseReason::Local);
    }

    fn close_with(&self, reason: CloseReason) {
        let (fd, on_close, reactor) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::Closed {
                return;
            }
            debug!(?reason, "adapter closing");
            inner.state = State::Closed;
            inner.recv_stopped = true;
            inner.read_registered = false;
            inner.write_registered = false;
            inner.on_receive = None;
            inner.on_writable = None;
            inner.on_shutdown_complete = None;
            inner.out.clear();
            (inner.fd.take(), inner.on_close.take(), inner.reactor.clone())
        };
        if let Some(fd) = fd {
            let _ = reactor.unregister_fd(fd.as_raw_fd());
            // Dropping the OwnedFd closes the socket.
        }
        if let Some(callback) = on_close {
            callback(reason);
        }
    }
}

impl std::fmt::Debug for SocketAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SocketAdapter")
            .field("state", &inner.state)
            .field("fd", &inner.raw_fd())
            .field("queued_bytes", &inner.out.len())
            .finish_non_exhaustive()
    }
}
