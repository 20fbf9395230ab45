//! Time sources and timers.
//!
//! [`Clock`] is the monotonic time source with a per-cycle cache; the
//! reactor refreshes it once at the top of each cycle so that every
//! callback in that cycle observes the same `now`. [`TimerHandle`] is the
//! caller's grip on a scheduled timer: cancel it, move its deadline, or
//! change its recurrence while it lives in the reactor's queue.

pub mod clock;
pub mod timer;

pub use clock::Clock;
pub use timer::TimerHandle;
pub(crate) use timer::{fire_due, TimerQueue};

/// Minimum recurrence interval. Non-zero intervals below this are clamped.
pub const MIN_INTERVAL: std::time::Duration = std::time::Duration::from_micros(1);
