use crate::{DriverOptions, IoSize, VdevError};
use alloc::boxed::Box;
use log::trace;

/// Bytes of configuration space a virtual device exposes.
pub const CONFIG_SPACE_SIZE: u16 = 256;

/// A kind of virtual device.
pub trait VirtualPciDriver: Sync {
    /// Short name used to select the driver, e.g. `virtio-net`.
    fn name(&self) -> &'static str;

    fn longname(&self) -> &'static str;

    /// Accepted option keys, in positional order.
    fn option_keys(&self) -> &'static [&'static str];

    /// Set up a fresh instance. Must [`PciVirtualDevice::attach`] its state.
    ///
    /// # Errors
    /// Driver-specific, typically [`VdevError::InvalidBool`] for a bad option.
    fn new(&self, dev: &mut PciVirtualDevice) -> Result<(), VdevError>;
}

/// Per-instance state of a virtual device.
///
/// `data` is exactly as long as `size`; `offset + size` stays within
/// [`CONFIG_SPACE_SIZE`].
pub trait VirtualPciHost: Send {
    fn config_read(&mut self, size: IoSize, offset: u16, data: &mut [u8]);
    fn config_write(&mut self, size: IoSize, offset: u16, data: &[u8]);
}

/// One virtual device on the bus.
pub struct PciVirtualDevice {
    driver: &'static str,
    options: DriverOptions,
    instance: u8,
    host: Option<Box<dyn VirtualPciHost>>,
}

impl PciVirtualDevice {
    pub(crate) const fn new(driver: &'static str, options: DriverOptions, instance: u8) -> Self {
        Self {
            driver,
            options,
            instance,
            host: None,
        }
    }

    #[must_use]
    pub const fn driver_name(&self) -> &'static str {
        self.driver
    }

    #[must_use]
    pub const fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// How many devices of this driver were created before this one
    /// (wrapping).
    #[must_use]
    pub const fn instance(&self) -> u8 {
        self.instance
    }

    pub fn attach(&mut self, host: Box<dyn VirtualPciHost>) {
        self.host = Some(host);
    }

    #[must_use]
    pub const fn has_host(&self) -> bool {
        self.host.is_some()
    }

    /// Guest read of `size` bytes at `offset`. Outside the configuration
    /// space, or without state, the device reads as all-ones.
    ///
    /// # Panics
    /// If `data` is shorter than `size`.
    pub fn config_read(&mut self, size: IoSize, offset: u16, data: &mut [u8]) {
        let data = &mut data[..size.len()];
        match self.host.as_mut() {
            Some(host) if in_config_space(size, offset) => host.config_read(size, offset, data),
            _ => {
                trace!("pci-virtual: {} read {offset:#x} unclaimed", self.driver);
                data.fill(0xFF);
            }
        }
    }

    /// Guest write of `size` bytes at `offset`. Dropped outside the
    /// configuration space.
    ///
    /// # Panics
    /// If `data` is shorter than `size`.
    pub fn config_write(&mut self, size: IoSize, offset: u16, data: &[u8]) {
        let data = &data[..size.len()];
        match self.host.as_mut() {
            Some(host) if in_config_space(size, offset) => host.config_write(size, offset, data),
            _ => trace!("pci-virtual: {} write {offset:#x} dropped", self.driver),
        }
    }
}

impl core::fmt::Debug for PciVirtualDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PciVirtualDevice")
            .field("driver", &self.driver)
            .field("instance", &self.instance)
            .field("options", &self.options)
            .field("host", &self.host.is_some())
            .finish()
    }
}

const fn in_config_space(size: IoSize, offset: u16) -> bool {
    (offset as usize) + size.len() <= CONFIG_SPACE_SIZE as usize
}
