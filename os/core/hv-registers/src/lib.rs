//! # Typed x86 control registers and MSRs
//!
//! Only what the paging and device-emulation code needs: the root-table
//! register ([`Cr3`]), the paging-mode bits of [`Cr4`] and [`Efer`], TLB
//! maintenance and the x2APIC self-IPI MSR.
//!
//! Register access itself (`mov crN`, `rdmsr`/`wrmsr`, `invlpg`) sits behind
//! the `asm` feature; the bit layouts are usable everywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod cr4;
pub mod efer;
pub mod msr;
#[cfg(feature = "asm")]
pub mod tlb;

pub use cr3::Cr3;
pub use cr4::Cr4;
pub use efer::Efer;
pub use msr::Msr;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Typically the access is privileged and requires CPL0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Typically the access is privileged and requires CPL0.
    unsafe fn store_unsafe(self);
}
