use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Access attribute bitmask.
///
/// Opaque to everything but the [`PhysMemory`](crate::PhysMemory)
/// implementation it is forwarded to; the named constants only exist so
/// callers don't spell raw numbers. Unknown bits are carried through.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct PhysAttr(u32);

impl PhysAttr {
    /// Plain cacheable access.
    pub const WRITEBACK: Self = Self(0);
    pub const WRITE_THROUGH: Self = Self(1 << 1);
    pub const UNCACHED: Self = Self(1 << 2);
    /// Compare-and-swap and stores must be atomic with respect to each other.
    pub const ATOMIC: Self = Self(1 << 8);

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for PhysAttr {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for PhysAttr {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for PhysAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAttr({:#x})", self.0)
    }
}
