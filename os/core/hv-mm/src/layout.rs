use hv_info::memory::{
    SHARED_WINDOW_32, SHARED_WINDOW_LONG_MODE, USER_END_LONG_MODE, USER_START, VMM_START_VIRT,
};
use hv_memory_addresses::{PAGE_SIZE, VirtualAddress};
use hv_pmap::PagingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("{0:#x} is not page-aligned")]
    Unaligned(u64),
    #[error("user_start < shared_start < user_end does not hold")]
    Misordered,
    #[error("user end {0:#x} is not a multiple of one root entry's span")]
    NotRootAligned(u64),
    #[error("user end {0:#x} exceeds the paging mode's address space")]
    TooLarge(u64),
}

/// Where user memory, stacks and the shared window live in a process space.
///
/// ```text
/// user_start .. shared_start   map_alloc, stacks (grow down from shared_start)
/// shared_start .. user_end     map_shared windows
/// user_end ..                  hypervisor, copied from the template root
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLayout {
    mode: PagingMode,
    user_start: u64,
    shared_start: u64,
    user_end: u64,
}

impl ProcessLayout {
    /// The default layout for `mode`.
    #[must_use]
    pub const fn for_mode(mode: PagingMode) -> Self {
        let (end, shared) = match mode {
            PagingMode::TwoLevel | PagingMode::Pae => (VMM_START_VIRT, SHARED_WINDOW_32),
            PagingMode::LongMode => (USER_END_LONG_MODE, SHARED_WINDOW_LONG_MODE),
        };
        Self {
            mode,
            user_start: USER_START,
            shared_start: end - shared,
            user_end: end,
        }
    }

    /// # Errors
    /// A [`LayoutError`] naming the first violated constraint.
    pub const fn new(
        mode: PagingMode,
        user_start: u64,
        shared_start: u64,
        user_end: u64,
    ) -> Result<Self, LayoutError> {
        if !user_start.is_multiple_of(PAGE_SIZE) {
            return Err(LayoutError::Unaligned(user_start));
        }
        if !shared_start.is_multiple_of(PAGE_SIZE) {
            return Err(LayoutError::Unaligned(shared_start));
        }
        if !(user_start < shared_start && shared_start < user_end) {
            return Err(LayoutError::Misordered);
        }
        if !user_end.is_multiple_of(mode.span(mode.top_level())) {
            return Err(LayoutError::NotRootAligned(user_end));
        }
        let limit = match mode {
            PagingMode::TwoLevel | PagingMode::Pae => 1 << 32,
            PagingMode::LongMode => 1 << 47,
        };
        if user_end >= limit {
            return Err(LayoutError::TooLarge(user_end));
        }
        Ok(Self {
            mode,
            user_start,
            shared_start,
            user_end,
        })
    }

    #[must_use]
    pub const fn mode(&self) -> PagingMode {
        self.mode
    }

    #[must_use]
    pub const fn user_start(&self) -> VirtualAddress {
        VirtualAddress::new(self.user_start)
    }

    #[must_use]
    pub const fn shared_start(&self) -> VirtualAddress {
        VirtualAddress::new(self.shared_start)
    }

    /// Stacks are placed below this address.
    #[must_use]
    pub const fn stack_top(&self) -> VirtualAddress {
        VirtualAddress::new(self.shared_start)
    }

    #[must_use]
    pub const fn user_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.user_end)
    }

    /// Whether `[start, end)` lies inside `[user_start, user_end)`.
    #[must_use]
    pub const fn contains(&self, start: u64, end: u64) -> bool {
        self.user_start <= start && start <= end && end <= self.user_end
    }
}
