use alloc::sync::Arc;
use log::trace;

/// Interrupt hooks the engine calls into.
pub trait InterruptSink: Send + Sync {
    fn clear(&self);
    /// Raise `vector`.
    fn set(&self, vector: u32);
    fn disable(&self);
    fn enable(&self);
    fn msix_disable(&self);
    fn msix_enable(&self);
}

/// Sends an interrupt to the current processor.
pub trait IpiSender: Send + Sync {
    fn self_ipi(&self, vector: u8);
}

/// Edge-triggered, fire-and-forget delivery of engine interrupts.
///
/// Only `set` does anything: vectors 0x20..=0xFF become a self-IPI, the rest
/// (exceptions, out-of-range) are dropped.
pub struct InterruptBridge {
    ipi: Arc<dyn IpiSender>,
}

impl InterruptBridge {
    #[must_use]
    pub fn new(ipi: Arc<dyn IpiSender>) -> Self {
        Self { ipi }
    }
}

impl InterruptSink for InterruptBridge {
    fn clear(&self) {}

    fn set(&self, vector: u32) {
        match u8::try_from(vector) {
            Ok(v) if v >= 0x20 => self.ipi.self_ipi(v),
            _ => trace!("virtio-net: dropped interrupt vector {vector:#x}"),
        }
    }

    fn disable(&self) {}

    fn enable(&self) {}

    fn msix_disable(&self) {}

    fn msix_enable(&self) {}
}

/// Self-IPI through the x2APIC `SELF_IPI` MSR.
///
/// Requires CPL0 and the local APIC in x2APIC mode.
#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
#[derive(Debug, Default, Clone, Copy)]
pub struct X2ApicSelfIpi;

#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
impl IpiSender for X2ApicSelfIpi {
    fn self_ipi(&self, vector: u8) {
        // SAFETY: CPL0 with x2APIC enabled is the precondition of this type.
        unsafe { hv_registers::Msr::X2APIC_SELF_IPI.write(u64::from(vector)) }
    }
}
