//! Monotonic clock with a per-cycle cache.

use std::cell::Cell;
use std::time::Instant;

/// A monotonic time source whose reading can be cached for the duration of
/// a reactor cycle.
///
/// The reactor calls [`Clock::refresh`] exactly once per cycle; everything
/// dispatched within that cycle (descriptor actions, deferred tasks, timer
/// firings) sees the same [`Clock::cached`] value. Code running outside a
/// cycle must use [`Clock::uncached`].
#[derive(Debug)]
pub struct Clock {
    cached: Cell<Instant>,
}

impl Clock {
    /// Creates a clock, priming the cache with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cached: Cell::new(Instant::now()),
        }
    }

    /// Returns the cached reading from the last [`refresh`](Self::refresh).
    #[must_use]
    pub fn cached(&self) -> Instant {
        self.cached.get()
    }

    /// Samples the OS clock, stores it in the cache, and returns it.
    pub fn refresh(&self) -> Instant {
        let now = Instant::now();
        self.cached.set(now);
        now
    }

    /// Samples the OS clock without touching the cache.
    #[must_use]
    pub fn uncached(&self) -> Instant {
        Instant::now()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cached_is_stable_until_refresh() {
        let clock = Clock::new();
        let first = clock.cached();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.cached(), first);

        let refreshed = clock.refresh();
        assert!(refreshed > first);
        assert_eq!(clock.cached(), refreshed);
    }

    #[test]
    fn uncached_advances() {
        let clock = Clock::new();
        let t1 = clock.cached();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.uncached();
        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(5));
    }
}
