//! Riptide: an event-driven I/O foundation for network services.
//!
//! # Overview
//!
//! The core is a [`Reactor`]: a single-threaded event loop that multiplexes
//! non-blocking descriptors (select or epoll behind one interface),
//! deadline-ordered timers with catch-up recurrence, and a deferred-task
//! queue. A [`Performer`] bridges arbitrary threads onto the reactor via a
//! mutex-guarded FIFO and a self-pipe wake. A [`SocketAdapter`] binds a
//! stream socket into the loop with buffered, capped writes and graceful
//! shutdown, and a [`WebSocketServer`] speaks RFC 6455 on top of a
//! streaming HTTP header parser.
//!
//! # Core Guarantees
//!
//! - **Single-threaded by construction**: reactor state is mutated only
//!   from the reactor thread; the `!Send` types make violations a compile
//!   error, not a race.
//! - **Timer ordering**: timers fire in `(deadline, insertion)` order;
//!   same-deadline timers are FIFO.
//! - **No lost writes**: bytes accepted by an open adapter are offered to
//!   the kernel in order, across as many writable edges as it takes.
//! - **Coalesced wakes**: a performer keeps at most one wake byte in
//!   flight no matter how many tasks are queued, and `close` runs every
//!   queued task before teardown.
//! - **Errors close, never corrupt**: protocol violations and fatal I/O
//!   tear the one session down through its close callback; the loop and
//!   other sessions keep running.
//!
//! # Module Structure
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`reactor`] | Event loop, descriptor registry, select/epoll backends |
//! | [`time`] | Monotonic clock, timer queue, timer handles |
//! | [`performer`] | Cross-thread dispatch with self-pipe wake |
//! | [`net`] | Socket adapter, close-reason plumbing, fd helpers |
//! | [`http`] | Streaming request-header parser |
//! | [`ws`] | WebSocket framing, handshake, session state machine |
//! | [`codec`] | `Decoder`/`Encoder` traits |
//! | [`config`] | Builder-style tuning for each component |
//!
//! # Parallelism
//!
//! There is no thread pool: run one reactor per thread, each with its own
//! adapters, and let [`Performer`] handles carry work between them.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod codec;
pub mod config;
pub mod http;
pub mod net;
pub mod performer;
pub mod reactor;
pub mod time;
pub mod ws;

pub use config::{AdapterConfig, ConfigError, ReactorConfig, WsConfig};
pub use net::{CloseReason, RecvFlow, SocketAdapter, WriteFlow};
pub use performer::{Performer, PerformerHandle};
pub use reactor::{Backend, Interest, Reactor, Stopper};
pub use time::{Clock, TimerHandle};
pub use ws::{Message, ServerHandshake, WebSocketServer};
