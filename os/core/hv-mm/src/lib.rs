//! # Process Address Spaces
//!
//! [`ProcessMm`] creates, populates and tears down process (or guest) root
//! tables on top of the [`hv_pmap::Pmap`] cursor:
//!
//! * [`ProcessMm::alloc`] / [`ProcessMm::free`]: root tables that share the
//!   hypervisor's upper half by copying its root entries.
//! * [`ProcessMm::map_alloc`] / [`ProcessMm::unmap`] / [`ProcessMm::unmapall`]:
//!   anonymous, zero-filled memory owned by the active space.
//! * [`ProcessMm::map_stack`] / [`ProcessMm::unmapstack`]: stacks with an
//!   unmapped guard page below.
//! * [`ProcessMm::map_shared_physpage`] / [`ProcessMm::map_shared`]: windows
//!   onto memory the active space does not own, marked with
//!   [`PageEntryBits::shared`](hv_pmap::PageEntryBits::shared) so teardown
//!   never frees it.
//! * [`ProcessMm::switch`]: swap the active root with interrupts masked.
//!
//! Tables left empty by [`ProcessMm::unmap`] stay installed; only
//! [`ProcessMm::free`] and [`ProcessMm::unmapall`] release tables.
//!
//! The running processor is abstracted by [`Processor`]; with the `asm`
//! feature [`LocalProcessor`] drives the real one.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod layout;
mod process;
mod processor;

pub use layout::{LayoutError, ProcessLayout};
pub use process::{ProcessMm, ProcessRoot};
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use processor::LocalProcessor;
pub use processor::Processor;

use hv_memory_addresses::VirtualAddress;
use hv_pmap::PmapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("{0} is already mapped")]
    Overlap(VirtualAddress),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is not writable")]
    ReadOnly(VirtualAddress),
    #[error("no free virtual range for {0:#x} bytes")]
    NoVirtualSpace(u64),
    #[error("{0} lies outside the user range")]
    OutOfUserRange(VirtualAddress),
    #[error(transparent)]
    Pmap(PmapError),
}

impl From<PmapError> for MmError {
    fn from(e: PmapError) -> Self {
        match e {
            PmapError::OutOfMemory => Self::OutOfMemory,
            e => Self::Pmap(e),
        }
    }
}
