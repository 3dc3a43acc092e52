//! # Page-Map Cursor
//!
//! A positionable walker over x86 page tables of any depth: classic two-level
//! 32-bit paging, three-level PAE and four-level long mode. The same cursor
//! serves the hypervisor's own tables and guest tables that guest processors
//! may be editing concurrently.
//!
//! ```text
//!  root register ─▶ [L4] ─▶ [L3] ─▶ [L2] ─▶ [L1] ─▶ page
//!   (sentinel)       │        │ PS=1 │ PS=1
//!                    │        └─1 GiB└─2/4 MiB leaf
//! ```
//!
//! A [`Pmap`] remembers every entry of its last walk. [`Pmap::seek`] reuses
//! the part of that walk whose index bits are unchanged, so sweeping a range
//! costs one load per page rather than one per level.
//!
//! All physical memory traffic goes through [`hv_phys::PhysAccess`]. A cursor
//! opened with [`PmapRole::Guest`] and `atomic = true` loads with
//! [`PhysAttr::ATOMIC`](hv_phys::PhysAttr::ATOMIC) and turns every store into
//! a compare-and-swap against the value it last observed; a lost race is
//! reported as [`PmapError::Raced`] and never retried internally.
//!
//! The cursor is a viewport: it owns no tables and frees nothing on
//! [`Pmap::close`]. It must not outlive the root table it walks.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod entry;
mod level;
mod mode;
mod pmap;

pub use entry::PageEntryBits;
pub use level::{Level, LevelArray};
pub use mode::PagingMode;
pub use pmap::{EntryPtr, Pmap, PmapRole, PmapTrace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmapError {
    #[error("out of memory while allocating a page table")]
    OutOfMemory,
    #[error("the walk stopped above the requested level; no table holds the slot")]
    NoParentTable,
    #[error("entry changed underneath the cursor")]
    Raced,
    #[error("a large page covers the requested level")]
    LargePage,
    #[error("unsupported paging depth: {0} levels")]
    InvalidLevels(u8),
}
