//! # Trapped MMIO Windows
//!
//! Guest-physical ranges that no RAM backs are routed to device emulation
//! through an [`MmioBus`]. A device registers a window together with an
//! [`MmioHandler`]; the trap path calls [`MmioBus::dispatch`] with the
//! faulting guest-physical address and gets back whether anyone claimed it.
//!
//! ```text
//!   guest access ─▶ trap ─▶ MmioBus::dispatch ─┬─▶ handler.access(..) ─▶ true
//!                                              └─▶ (no window)        ─▶ false
//! ```
//!
//! Handlers run synchronously on the trapping processor and without the bus
//! lock held, so they are free to register, move or drop windows themselves.
//! [`MmioBus::relocate`] moves a window in one step: at no point is an access
//! to either the old or the new base left without a handler.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod bus;

pub use bus::{MmioBus, MmioHandle};

use hv_memory_addresses::PhysicalAddress;

/// Emulation behind a trapped window.
pub trait MmioHandler: Send + Sync {
    /// Serve an access at `gphys` of `buf.len()` bytes.
    ///
    /// On reads `buf` is the destination, on writes the source. `flags` are
    /// the trap path's access attributes, passed through untouched. Returns
    /// whether the access was handled.
    fn access(&self, gphys: PhysicalAddress, write: bool, buf: &mut [u8], flags: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmioError {
    #[error("empty or wrapping MMIO window at {base}")]
    InvalidWindow { base: PhysicalAddress },
    #[error("MMIO window at {base} (+{len:#x}) overlaps an existing one")]
    Overlap { base: PhysicalAddress, len: u64 },
    #[error("no MMIO window {0:?}")]
    UnknownHandle(MmioHandle),
}
