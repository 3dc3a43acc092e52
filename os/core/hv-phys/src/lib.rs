//! # Attributed Physical Memory Access
//!
//! Everything above this crate touches physical memory (page tables, guest
//! RAM, device windows) through [`PhysAccess`]: byte/word/long/quad loads and
//! stores plus long/quad compare-and-swap, each carrying an opaque
//! [`PhysAttr`] that is handed to the backing [`PhysMemory`] unchanged.
//!
//! ```text
//! ┌──────────────┐  read_q/write_q/cmpxchg_q   ┌──────────────┐
//! │ Pmap, mm, …  │ ──────────────────────────▶ │  PhysAccess  │
//! └──────────────┘                             └──────┬───────┘
//!                                   read/write/cmpxchg │ Result<_, PhysError>
//!                                              ┌──────▼───────┐
//!                                              │  PhysMemory  │ (RAM, MMIO, …)
//!                                              └──────────────┘
//! ```
//!
//! A physical address nothing backs never faults the hypervisor: loads return
//! [`PHYS_FILL`] (all-ones, what a floating bus reads) and stores are dropped.
//!
//! Page-frame allocation ([`FrameAlloc`]) and direct addressability of
//! physical pages ([`PhysMapper`]) are collaborator traits as well. The `ram`
//! feature provides [`SparseRam`], an in-memory store implementing all three.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "ram")]
extern crate alloc;

mod access;
mod attr;
mod frame_alloc;
#[cfg(feature = "ram")]
mod ram;

pub use access::{PHYS_FILL, PhysAccess};
pub use attr::PhysAttr;
pub use frame_alloc::{FrameAlloc, PhysMapper};
#[cfg(feature = "ram")]
pub use ram::SparseRam;

use hv_memory_addresses::PhysicalAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PhysError {
    #[error("no resource backs physical address {0}")]
    Unbacked(PhysicalAddress),
}

/// A physical-memory store: host RAM, an MMIO decoder, a test double.
///
/// Implementations report addresses they cannot serve with
/// [`PhysError::Unbacked`]; [`PhysAccess`] turns that into the fill/drop
/// behaviour. Accesses may be unaligned and may cross page boundaries.
pub trait PhysMemory {
    /// # Errors
    /// [`PhysError::Unbacked`] if any byte of the range is not backed.
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8], attr: PhysAttr) -> Result<(), PhysError>;

    /// # Errors
    /// [`PhysError::Unbacked`] if any byte of the range is not backed.
    fn write(&self, pa: PhysicalAddress, buf: &[u8], attr: PhysAttr) -> Result<(), PhysError>;

    /// Store `new` if the 32-bit value at `pa` equals `current`; returns the
    /// value observed before the operation.
    ///
    /// Atomic with respect to other compare-and-swaps and writes only if
    /// `attr` contains [`PhysAttr::ATOMIC`].
    ///
    /// # Errors
    /// [`PhysError::Unbacked`].
    fn compare_exchange_u32(
        &self,
        pa: PhysicalAddress,
        current: u32,
        new: u32,
        attr: PhysAttr,
    ) -> Result<u32, PhysError>;

    /// 64-bit variant of [`PhysMemory::compare_exchange_u32`].
    ///
    /// # Errors
    /// [`PhysError::Unbacked`].
    fn compare_exchange_u64(
        &self,
        pa: PhysicalAddress,
        current: u64,
        new: u64,
        attr: PhysAttr,
    ) -> Result<u64, PhysError>;
}

impl<T: PhysMemory + ?Sized> PhysMemory for &T {
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8], attr: PhysAttr) -> Result<(), PhysError> {
        (**self).read(pa, buf, attr)
    }

    fn write(&self, pa: PhysicalAddress, buf: &[u8], attr: PhysAttr) -> Result<(), PhysError> {
        (**self).write(pa, buf, attr)
    }

    fn compare_exchange_u32(
        &self,
        pa: PhysicalAddress,
        current: u32,
        new: u32,
        attr: PhysAttr,
    ) -> Result<u32, PhysError> {
        (**self).compare_exchange_u32(pa, current, new, attr)
    }

    fn compare_exchange_u64(
        &self,
        pa: PhysicalAddress,
        current: u64,
        new: u64,
        attr: PhysAttr,
    ) -> Result<u64, PhysError> {
        (**self).compare_exchange_u64(pa, current, new, attr)
    }
}
