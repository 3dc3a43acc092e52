use crate::InterruptSink;
use alloc::sync::Arc;
use hv_pci_virtual::IoSize;

/// The virtio-net device model proper.
pub trait VirtioNetEngine: Send + Sync {
    /// Fill in the engine's view of configuration space. `data` already
    /// holds the fixed registers; bytes the engine does not own stay as they
    /// are.
    fn config_read(&self, size: IoSize, offset: u16, data: &mut [u8]);

    fn config_write(&self, size: IoSize, offset: u16, data: &[u8]);

    /// Access at `offset` into the BAR window (MSI-X table and registers).
    fn msix_access(&self, write: bool, offset: u64, buf: &mut [u8]);

    /// Place the MSI-X table in BAR `bar`.
    fn set_msix(&self, bar: u8);
}

pub trait VirtioNetEngineFactory: Send + Sync {
    /// A new engine with MAC `mac`, raising interrupts through `irq`.
    /// `None` if it could not be set up.
    fn init(&self, mac: [u8; 6], irq: Arc<dyn InterruptSink>) -> Option<Arc<dyn VirtioNetEngine>>;
}
