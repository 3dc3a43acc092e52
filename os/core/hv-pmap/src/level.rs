//! Level index type and level-indexed storage.

use core::fmt;
use core::ops::{Index, IndexMut};

/// A paging level, counted from the leaf: [`Level::L1`] holds page-table
/// entries (4 KiB leaves), [`Level::L2`] page-directory entries, [`Level::L3`]
/// PDPT entries and [`Level::L4`] PML4 entries.
///
/// One level above the top table sits the *root* pseudo-level
/// ([`Level::root`]), whose "entry" is the root register itself. For two-level
/// paging that is `L3`; for four-level paging it is level 5.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Level(u8);

impl Level {
    pub const L1: Self = Self(1);
    pub const L2: Self = Self(2);
    pub const L3: Self = Self(3);
    pub const L4: Self = Self(4);

    /// Highest level any mode uses (the root of four-level paging).
    pub(crate) const MAX: u8 = 5;

    /// `None` unless `1 <= n <= 5`.
    #[must_use]
    pub const fn new(n: u8) -> Option<Self> {
        if n >= 1 && n <= Self::MAX {
            Some(Self(n))
        } else {
            None
        }
    }

    /// The root pseudo-level of a `levels`-deep hierarchy.
    #[must_use]
    pub(crate) const fn root(levels: u8) -> Self {
        Self(levels + 1)
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// The next level towards the leaf, `None` below `L1`.
    #[must_use]
    pub const fn below(self) -> Option<Self> {
        if self.0 > 1 { Some(Self(self.0 - 1)) } else { None }
    }

    const fn slot(self) -> usize {
        self.0 as usize - 1
    }
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fixed-capacity storage with one slot per level, starting at `L1`.
///
/// Indexing with a level beyond the capacity panics; the cursor only ever
/// indexes levels its paging mode has.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LevelArray<T, const N: usize>([T; N]);

impl<T: Copy, const N: usize> LevelArray<T, N> {
    #[must_use]
    pub const fn filled(value: T) -> Self {
        Self([value; N])
    }
}

impl<T, const N: usize> Index<Level> for LevelArray<T, N> {
    type Output = T;
    fn index(&self, level: Level) -> &T {
        &self.0[level.slot()]
    }
}

impl<T, const N: usize> IndexMut<Level> for LevelArray<T, N> {
    fn index_mut(&mut self, level: Level) -> &mut T {
        &mut self.0[level.slot()]
    }
}
