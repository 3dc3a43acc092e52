//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses used by the page-table cursor,
//! the address-space manager and the device emulation code.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | host-physical (or guest-physical) memory, MMIO |
//! | [`VirtualAddress`]  | an address translated through some page table |
//!
//! Page sizes are marker types implementing [`PageSize`]. Besides the
//! long-mode sizes ([`Size4K`], [`Size2M`], [`Size1G`]) there is [`Size4M`],
//! the large page of classic two-level 32-bit paging.
//!
//! ```rust
//! # use hv_memory_addresses::*;
//! let va = VirtualAddress::new(0x4000_1234);
//! assert_eq!(va.align_down::<Size4K>().as_u64(), 0x4000_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! assert_eq!(va.offset::<Size4M>(), 0x1234);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

use core::fmt;
use core::hash::Hash;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:expr) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;
        impl sealed::Sealed for $name {}
        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
        }
    };
}

page_size!(
    /// 4 KiB page, the base granularity of every paging mode.
    Size4K,
    12
);
page_size!(
    /// 2 MiB large page (PAE and long mode, `PS=1` in a PDE).
    Size2M,
    21
);
page_size!(
    /// 4 MiB large page (two-level 32-bit paging, `PS=1` in a PDE).
    Size4M,
    22
);
page_size!(
    /// 1 GiB giant page (long mode, `PS=1` in a PDPTE).
    Size1G,
    30
);

/// Bytes in a base page.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use hv_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + (a - 1)` must not overflow.
///
/// ```rust
/// # use hv_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Number of base pages touched by `[start, start + len)`.
///
/// ```rust
/// # use hv_memory_addresses::pages_spanned;
/// assert_eq!(pages_spanned(0x1000, 0x1000), 1);
/// assert_eq!(pages_spanned(0x1FFF, 2), 2);
/// assert_eq!(pages_spanned(0x1000, 0), 0);
/// ```
#[inline]
#[must_use]
pub const fn pages_spanned(start: u64, len: u64) -> u64 {
    if len == 0 {
        return 0;
    }
    let first = align_down(start, PAGE_SIZE);
    let last = align_down(start + len - 1, PAGE_SIZE);
    (last - first) / PAGE_SIZE + 1
}
