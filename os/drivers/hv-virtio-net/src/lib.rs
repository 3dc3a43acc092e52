//! # Virtual virtio-net Device
//!
//! A PCI network function that only exists in the hypervisor. The virtio
//! transport itself (queues, feature negotiation, the MSI-X table) lives in
//! an external [`VirtioNetEngine`]; the guest side of the network is an
//! external [`NetBackend`] (e.g. a TCP/IP stack). This crate is the glue:
//!
//! * configuration space: fixed Status, Class and Interrupt registers, the
//!   engine's capabilities and a relocatable memory BAR (BAR 5),
//! * the 4 KiB MMIO window behind BAR 5, trapped on an [`hv_mmio::MmioBus`]
//!   and forwarded to the engine,
//! * interrupts raised by the engine, delivered as a self-IPI on the
//!   processor that raised them.
//!
//! ```text
//!  guest cfg ──▶ VirtioNetHost ──▶ engine.config_*   (BAR 5 write ─▶ bus.relocate)
//!  guest MMIO ─▶ MmioBus ─▶ MsixWindow ─▶ engine.msix_access
//!  engine ─▶ InterruptBridge::set(v) ─▶ IpiSender::self_ipi(v)   if 0x20 <= v <= 0xFF
//! ```
//!
//! Register the driver with [`VirtioNetDriver::register`], then create
//! devices with `instantiate("virtio-net", [tty, net])`.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod backend;
mod device;
mod engine;
mod interrupt;

pub use backend::{NetBackend, NetBackendFactory, NicInfo};
pub use device::{DRIVER_NAME, VirtioNetDriver};
pub use engine::{VirtioNetEngine, VirtioNetEngineFactory};
#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
pub use interrupt::X2ApicSelfIpi;
pub use interrupt::{InterruptBridge, InterruptSink, IpiSender};

/// Configuration-space offsets and values this device fixes.
pub mod regs {
    /// Status: capabilities list present.
    pub const STATUS: u16 = 0x06;
    pub const STATUS_VALUE: u32 = 0x0010;

    /// Class code: network controller, Ethernet (revision byte zero).
    pub const CLASS: u16 = 0x08;
    pub const CLASS_VALUE: u32 = 0x0200_0000;

    /// Interrupt line 0xFF (none), pin 1 (INTA#).
    pub const INTERRUPT: u16 = 0x3C;
    pub const INTERRUPT_VALUE: u32 = 0x0000_01FF;

    /// BAR 5, the MSI-X and register window.
    pub const BAR5: u16 = 0x24;
    /// Address bits of a 32-bit memory BAR.
    pub const BAR_MEM_MASK: u32 = 0xFFFF_FFF0;
    /// What BAR 5 reads back while the guest sizes it: a 4 KiB window.
    pub const BAR5_SIZE_MASK: u32 = 0xFFFF_F000;
    /// BAR 5 before the guest assigns it.
    pub const BAR5_RESET: u32 = 0xFFFF_F000;

    /// The BAR number handed to the engine for its MSI-X table.
    pub const MSIX_BAR: u8 = 5;
}

/// Locally administered OUI prefix; the last byte is the instance number.
pub const MAC_PREFIX: [u8; 5] = [0x02, 0x48, 0x84, 0x76, 0x70];
