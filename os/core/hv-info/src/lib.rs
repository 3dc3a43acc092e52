//! # Hypervisor Layout Configuration
//!
//! Compile-time constants shared by the address-space manager and the device
//! emulation code. Everything here is validated with `const` assertions, so an
//! inconsistent edit fails the build rather than a boot.
//!
//! ## Process address space
//!
//! A process (or guest) root table covers user space below the hypervisor's
//! own mappings. The boundary is a multiple of the span of one root-table
//! entry, so the hypervisor half can be shared by copying root entries.
//!
//! ```text
//! 0                     ┌──────────────────────────┐
//!                       │ null guard (unmapped)    │
//! USER_START            ├──────────────────────────┤
//!                       │ map_alloc'd memory       │
//!                       │ ...                      │
//!                       │ stacks (grow down)       │
//! shared_start          ├──────────────────────────┤ = stack top
//!                       │ shared window            │
//!                       │ (map_shared)             │
//! user_end              ├──────────────────────────┤ = VMM_START_VIRT (32-bit)
//!                       │ hypervisor (copied)      │
//!                       └──────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
