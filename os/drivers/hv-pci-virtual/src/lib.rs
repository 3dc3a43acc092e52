//! # Virtual PCI Devices
//!
//! Devices that exist only in the hypervisor but show up on the guest's PCI
//! bus. A [`VirtualPciDriver`] is registered once with a
//! [`VirtualDriverRegistry`]; every [`VirtualDriverRegistry::instantiate`]
//! then yields a [`PciVirtualDevice`] whose configuration space the bus code
//! forwards to the driver's [`VirtualPciHost`].
//!
//! ```text
//!  registry.instantiate("virtio-net", ["1", "ip"])
//!        │
//!        ▼
//!  driver.new(&mut dev) ──▶ dev.attach(host)
//!
//!  guest cfg read/write ──▶ dev.config_read/config_write ──▶ host
//! ```
//!
//! [`config`] holds the byte-range patching used to overlay fixed register
//! values onto a configuration read of any width and offset.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod config;
mod device;
mod options;
mod registry;

pub use device::{CONFIG_SPACE_SIZE, PciVirtualDevice, VirtualPciDriver, VirtualPciHost};
pub use options::DriverOptions;
pub use registry::VirtualDriverRegistry;

use alloc::string::String;

/// Width of a configuration-space access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoSize {
    Byte,
    Word,
    Dword,
}

impl IoSize {
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    #[must_use]
    pub const fn from_len(len: usize) -> Option<Self> {
        match len {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VdevError {
    #[error("a virtual driver named {0:?} is already registered")]
    DuplicateDriver(&'static str),
    #[error("no virtual driver named {0:?}")]
    UnknownDriver(String),
    #[error("{driver} takes {accepted} options, got {given}")]
    TooManyOptions {
        driver: &'static str,
        accepted: usize,
        given: usize,
    },
    #[error("option {key}={value:?} is not a boolean")]
    InvalidBool { key: &'static str, value: String },
    #[error("{0} did not attach device state")]
    NoHost(&'static str),
}
