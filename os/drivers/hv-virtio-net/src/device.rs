use crate::regs::{
    BAR_MEM_MASK, BAR5, BAR5_RESET, BAR5_SIZE_MASK, CLASS, CLASS_VALUE, INTERRUPT, INTERRUPT_VALUE,
    MSIX_BAR, STATUS, STATUS_VALUE,
};
use crate::{
    InterruptBridge, IpiSender, MAC_PREFIX, NetBackend, NetBackendFactory, NicInfo, VirtioNetEngine,
    VirtioNetEngineFactory,
};
use alloc::boxed::Box;
use alloc::sync::Arc;
use hv_info::memory::MMIO_WINDOW_SIZE;
use hv_memory_addresses::PhysicalAddress;
use hv_mmio::{MmioBus, MmioHandle, MmioHandler};
use hv_pci_virtual::config::{ConfigField, ConfigWindow, overlay};
use hv_pci_virtual::{
    IoSize, PciVirtualDevice, VdevError, VirtualDriverRegistry, VirtualPciDriver, VirtualPciHost,
};
use hv_sync::SpinLock;
use log::{debug, info, warn};

pub const DRIVER_NAME: &str = "virtio-net";

const OPTION_KEYS: &[&str] = &["tty", "net"];
const OPT_TTY: usize = 0;
const OPT_NET: usize = 1;

/// The `virtio-net` virtual PCI driver.
pub struct VirtioNetDriver {
    bus: Arc<MmioBus>,
    backends: Arc<dyn NetBackendFactory>,
    engines: Arc<dyn VirtioNetEngineFactory>,
    ipi: Arc<dyn IpiSender>,
}

impl VirtioNetDriver {
    /// Devices trap their BAR window on `bus`, get their network from
    /// `backends`, their device model from `engines` and deliver interrupts
    /// with `ipi`.
    #[must_use]
    pub fn new(
        bus: Arc<MmioBus>,
        backends: Arc<dyn NetBackendFactory>,
        engines: Arc<dyn VirtioNetEngineFactory>,
        ipi: Arc<dyn IpiSender>,
    ) -> Self {
        Self {
            bus,
            backends,
            engines,
            ipi,
        }
    }

    /// Make the driver available for instantiation. Drivers live for the
    /// rest of the hypervisor's lifetime.
    ///
    /// # Errors
    /// [`VdevError::DuplicateDriver`] if `virtio-net` is already registered.
    pub fn register(self, registry: &VirtualDriverRegistry) -> Result<(), VdevError> {
        registry.register_virtual_driver(Box::leak(Box::new(self)))
    }
}

impl VirtualPciDriver for VirtioNetDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn longname(&self) -> &'static str {
        "virtio-net virtual driver"
    }

    fn option_keys(&self) -> &'static [&'static str] {
        OPTION_KEYS
    }

    fn new(&self, dev: &mut PciVirtualDevice) -> Result<(), VdevError> {
        let tty = dev.options().get_bool(OPT_TTY)?.unwrap_or(false);
        let mut backend = self.backends.new_nic(dev.options().get(OPT_NET), tty);

        let mut mac = [0; 6];
        mac[..5].copy_from_slice(&MAC_PREFIX);
        mac[5] = dev.instance();

        let irq = Arc::new(InterruptBridge::new(Arc::clone(&self.ipi)));
        let engine = self.engines.init(mac, irq);
        match &engine {
            Some(engine) => {
                engine.set_msix(MSIX_BAR);
                backend.bind(Arc::clone(engine), NicInfo::virtual_nic(mac));
                backend.start();
                info!("virtio-net: instance {} up, mac {mac:02x?}", dev.instance());
            }
            None => warn!(
                "virtio-net: instance {}: engine init failed, device stays absent",
                dev.instance()
            ),
        }

        dev.attach(Box::new(VirtioNetHost {
            shared: Arc::new(Shared {
                engine,
                bus: Arc::clone(&self.bus),
                bar: SpinLock::new(BarState {
                    membase: BAR5_RESET,
                    probing: false,
                    window: None,
                }),
            }),
            _backend: backend,
        }));
        Ok(())
    }
}

struct BarState {
    /// Base of the MMIO window as last assigned by the guest.
    membase: u32,
    /// The guest wrote the sizing pattern; BAR 5 reads back the size mask.
    probing: bool,
    /// Live window on the bus, anchored at `membase`.
    window: Option<MmioHandle>,
}

struct Shared {
    engine: Option<Arc<dyn VirtioNetEngine>>,
    bus: Arc<MmioBus>,
    bar: SpinLock<BarState>,
}

impl Shared {
    /// Move (or first create) the window to `base`. Called with `bar` locked.
    fn place_window(self: &Arc<Self>, bar: &mut BarState, base: u32) {
        let base = PhysicalAddress::new(u64::from(base));
        if let Some(handle) = bar.window {
            match self.bus.relocate(handle, base) {
                Ok(()) => return,
                Err(e) => {
                    warn!("virtio-net: cannot move BAR window to {base}: {e}");
                    if let Err(e) = self.bus.unregister(handle) {
                        warn!("virtio-net: {e}");
                    }
                    bar.window = None;
                }
            }
        }
        let handler: Arc<dyn MmioHandler> = Arc::new(MsixWindow {
            shared: Arc::clone(self),
        });
        match self.bus.register(base, MMIO_WINDOW_SIZE, handler) {
            Ok(handle) => {
                debug!("virtio-net: BAR window at {base}");
                bar.window = Some(handle);
            }
            Err(e) => warn!("virtio-net: cannot trap BAR window: {e}"),
        }
    }
}

struct VirtioNetHost {
    shared: Arc<Shared>,
    _backend: Box<dyn NetBackend>,
}

impl VirtualPciHost for VirtioNetHost {
    fn config_read(&mut self, size: IoSize, offset: u16, data: &mut [u8]) {
        let Some(engine) = &self.shared.engine else {
            data.fill(0xFF);
            return;
        };
        let window = ConfigWindow::new(size, offset);
        data.fill(0);
        overlay(window, ConfigField::new(STATUS, 2, STATUS_VALUE), data);
        overlay(window, ConfigField::new(CLASS, 4, CLASS_VALUE), data);
        overlay(window, ConfigField::new(INTERRUPT, 4, INTERRUPT_VALUE), data);
        engine.config_read(size, offset, data);

        let bar = self.shared.bar.with_lock(|bar| {
            if bar.probing {
                BAR5_SIZE_MASK
            } else {
                bar.membase
            }
        });
        overlay(window, ConfigField::new(BAR5, 4, bar), data);
    }

    fn config_write(&mut self, size: IoSize, offset: u16, data: &[u8]) {
        let Some(engine) = &self.shared.engine else {
            return;
        };
        engine.config_write(size, offset, data);
        if offset != BAR5 {
            return;
        }

        let mut bar = self.shared.bar.lock();
        // Narrow writes replace the low bytes only.
        let mut value = bar.membase.to_le_bytes();
        let n = data.len().min(value.len());
        value[..n].copy_from_slice(&data[..n]);
        let value = u32::from_le_bytes(value);

        if value & BAR_MEM_MASK == BAR_MEM_MASK {
            bar.probing = true;
            return;
        }
        bar.probing = false;
        let base = value & !(0x1000 - 1);
        if base != bar.membase {
            bar.membase = base;
            self.shared.place_window(&mut bar, base);
        }
    }
}

impl Drop for VirtioNetHost {
    fn drop(&mut self) {
        // The bus holds the window's handler; untrap it so the base is free
        // again and the engine is no longer reachable from the guest.
        let window = self.shared.bar.lock().window.take();
        if let Some(handle) = window
            && let Err(e) = self.shared.bus.unregister(handle)
        {
            warn!("virtio-net: {e}");
        }
    }
}

/// The trapped BAR 5 window.
struct MsixWindow {
    shared: Arc<Shared>,
}

impl MmioHandler for MsixWindow {
    fn access(&self, gphys: PhysicalAddress, write: bool, buf: &mut [u8], _flags: u32) -> bool {
        if !write {
            buf.fill(0);
        }
        let membase = self.shared.bar.with_lock(|bar| u64::from(bar.membase));
        if let Some(engine) = &self.shared.engine {
            engine.msix_access(write, gphys.as_u64().wrapping_sub(membase), buf);
        }
        true
    }
}
