use crate::{DriverOptions, PciVirtualDevice, VdevError, VirtualPciDriver};
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};
use hv_sync::SpinLock;
use log::info;

struct Registered {
    driver: &'static dyn VirtualPciDriver,
    /// Instances created so far; the next one gets this number.
    instances: AtomicU8,
}

/// The set of virtual drivers available for instantiation.
pub struct VirtualDriverRegistry {
    drivers: SpinLock<Vec<Arc<Registered>>>,
}

impl Default for VirtualDriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDriverRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            drivers: SpinLock::new(Vec::new()),
        }
    }

    /// # Errors
    /// [`VdevError::DuplicateDriver`] if a driver of that name is registered.
    pub fn register_virtual_driver(&self, driver: &'static dyn VirtualPciDriver) -> Result<(), VdevError> {
        let mut drivers = self.drivers.lock();
        if drivers.iter().any(|r| r.driver.name() == driver.name()) {
            return Err(VdevError::DuplicateDriver(driver.name()));
        }
        drivers.push(Arc::new(Registered {
            driver,
            instances: AtomicU8::new(0),
        }));
        info!("pci-virtual: registered {} ({})", driver.name(), driver.longname());
        Ok(())
    }

    /// Names of the registered drivers.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.drivers.lock().iter().map(|r| r.driver.name()).collect()
    }

    /// Create a device of driver `name` with positional `options`.
    ///
    /// # Errors
    /// - [`VdevError::UnknownDriver`], [`VdevError::TooManyOptions`].
    /// - Whatever the driver's [`VirtualPciDriver::new`] reports, or
    ///   [`VdevError::NoHost`] if it attached no state.
    pub fn instantiate(&self, name: &str, options: &[Option<&str>]) -> Result<PciVirtualDevice, VdevError> {
        let entry = self
            .drivers
            .lock()
            .iter()
            .find(|r| r.driver.name() == name)
            .cloned()
            .ok_or_else(|| VdevError::UnknownDriver(name.to_string()))?;
        let driver = entry.driver;

        let options = DriverOptions::new(driver.name(), driver.option_keys(), options)?;
        let instance = entry.instances.fetch_add(1, Ordering::Relaxed);
        let mut dev = PciVirtualDevice::new(driver.name(), options, instance);
        driver.new(&mut dev)?;
        if !dev.has_host() {
            return Err(VdevError::NoHost(driver.name()));
        }
        info!("pci-virtual: {} instance {instance}", driver.name());
        Ok(dev)
    }
}
