//! # Hypervisor synchronization primitives
//!
//! Two building blocks are shared by the memory and device-emulation crates:
//!
//! - [`SpinLock`]: a test-and-test-and-set lock for short critical sections
//!   that never sleep (frame maps, the MMIO window table, device state).
//! - [`IrqGuard`]: disables interrupts on the current processor for the
//!   guard's lifetime (x86 only), used around root-table switches.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod irq;
mod spin_lock;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
