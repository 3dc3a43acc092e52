use hv_memory_addresses::VirtualAddress;

/// The processor an address space is active on.
pub trait Processor {
    /// Current root register value.
    fn root(&self) -> u64;

    /// Load a new root register value. Implies a flush of non-global
    /// translations.
    fn set_root(&self, root: u64);

    /// Drop the cached translation of one page.
    fn invalidate(&self, va: VirtualAddress);

    /// Drop all non-global cached translations.
    fn flush(&self);

    /// Run `f` with interrupts masked on this processor.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R;
}

/// The processor this code runs on.
///
/// Only usable at CPL0 with paging enabled; every method executes privileged
/// instructions.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProcessor;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl Processor for LocalProcessor {
    fn root(&self) -> u64 {
        use hv_registers::LoadRegisterUnsafe;
        // SAFETY: CPL0 is a precondition of constructing this type's users.
        unsafe { hv_registers::Cr3::load_unsafe() }.into_bits()
    }

    fn set_root(&self, root: u64) {
        use hv_registers::StoreRegisterUnsafe;
        // SAFETY: the caller hands us a root that maps the running code.
        unsafe { hv_registers::Cr3::from_bits(root).store_unsafe() }
    }

    fn invalidate(&self, va: VirtualAddress) {
        // SAFETY: invalidating a translation has no effect beyond the TLB.
        unsafe { hv_registers::tlb::invlpg(va) }
    }

    fn flush(&self) {
        // SAFETY: reloads the current CR3 unchanged.
        unsafe { hv_registers::tlb::flush_all() }
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        let _irq = hv_sync::IrqGuard::new();
        f()
    }
}
