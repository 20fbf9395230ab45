//! Readiness conditions for registered descriptors.

/// A set of descriptor conditions to monitor.
///
/// A descriptor may be registered under any subset of the three conditions;
/// each condition carries its own action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No conditions.
    pub const NONE: Interest = Interest(0);
    /// The descriptor is readable (or has reached EOF / an error state).
    pub const READABLE: Interest = Interest(0b001);
    /// The descriptor is writable.
    pub const WRITABLE: Interest = Interest(0b010);
    /// An exceptional condition (out-of-band data, `EPOLLPRI`).
    pub const EXCEPTION: Interest = Interest(0b100);

    /// Dispatch order within one cycle: read before write before exception.
    pub(crate) const DISPATCH_ORDER: [Interest; 3] =
        [Self::READABLE, Self::WRITABLE, Self::EXCEPTION];

    /// Interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Interest(0b011)
    }

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if exception interest is set.
    #[must_use]
    pub const fn is_exception(self) -> bool {
        self.0 & Self::EXCEPTION.0 != 0
    }

    /// Returns true if no condition is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every condition in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combines conditions.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Removes conditions.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}
