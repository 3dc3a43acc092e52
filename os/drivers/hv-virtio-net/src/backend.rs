use crate::VirtioNetEngine;
use alloc::boxed::Box;
use alloc::sync::Arc;

/// How the virtual NIC presents itself to the back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicInfo {
    pub mtu: u32,
    /// Bits per second.
    pub media_speed: u64,
    pub mac: [u8; 6],
}

impl NicInfo {
    /// 1500-byte MTU, 1 Gbit/s.
    #[must_use]
    pub const fn virtual_nic(mac: [u8; 6]) -> Self {
        Self {
            mtu: 1500,
            media_speed: 1_000_000_000,
            mac,
        }
    }
}

/// The network the guest is plugged into.
pub trait NetBackend: Send {
    /// Connect the engine as the packet-carrying side; `nic` describes the
    /// virtual function towards the back-end. Its send, receive and poll
    /// hooks do nothing.
    fn bind(&mut self, engine: Arc<dyn VirtioNetEngine>, nic: NicInfo);

    fn start(&mut self);
}

pub trait NetBackendFactory: Send + Sync {
    /// A back-end for `selector` (the `net` option, e.g. `ip`). `tty` asks
    /// for the hypervisor console to be reachable through it.
    fn new_nic(&self, selector: Option<&str>, tty: bool) -> Box<dyn NetBackend>;
}
