//! # Memory Layout

/// Lowest user address; page 0 stays unmapped to catch null dereferences.
pub const USER_START: u64 = 0x1000;

/// Start of the hypervisor's own virtual range with 32-bit paging (two-level
/// or PAE). Everything below belongs to the process.
pub const VMM_START_VIRT: u64 = 0x4000_0000;

/// End of user space with four-level paging: exactly one PML4 entry.
pub const USER_END_LONG_MODE: u64 = 0x80_0000_0000;

/// Size of the shared window directly below `VMM_START_VIRT`.
pub const SHARED_WINDOW_32: u64 = 0x1000_0000;

/// Size of the shared window directly below [`USER_END_LONG_MODE`].
pub const SHARED_WINDOW_LONG_MODE: u64 = 0x10_0000_0000;

/// Span covered by one root-table entry, per paging depth.
pub const ROOT_SPAN_TWO_LEVEL: u64 = 0x40_0000;
pub const ROOT_SPAN_PAE: u64 = 0x4000_0000;
pub const ROOT_SPAN_LONG_MODE: u64 = 0x80_0000_0000;

/// Size of the MMIO window a virtual device exposes through its BAR.
pub const MMIO_WINDOW_SIZE: u64 = 0x1000;

const _: () = {
    assert!(USER_START.is_multiple_of(4096));
    assert!(VMM_START_VIRT.is_multiple_of(ROOT_SPAN_TWO_LEVEL));
    assert!(VMM_START_VIRT.is_multiple_of(ROOT_SPAN_PAE));
    assert!(USER_END_LONG_MODE.is_multiple_of(ROOT_SPAN_LONG_MODE));
    assert!(SHARED_WINDOW_32 < VMM_START_VIRT - USER_START);
    assert!(SHARED_WINDOW_LONG_MODE < USER_END_LONG_MODE - USER_START);
    assert!(MMIO_WINDOW_SIZE == 4096);
};
