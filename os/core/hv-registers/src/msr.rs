//! Model-specific registers.

/// A model-specific register index, as consumed by `rdmsr`/`wrmsr`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(pub u32);

impl Msr {
    pub const IA32_EFER: Self = Self(0xC000_0080);

    /// x2APIC `SELF_IPI`: writing a vector to bits 0..8 sends a fixed,
    /// edge-triggered interrupt with that vector to the local processor.
    pub const X2APIC_SELF_IPI: Self = Self(0x83F);

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// # Safety
    /// `rdmsr` is CPL0-only and faults on MSRs the processor does not implement.
    #[cfg(feature = "asm")]
    #[inline]
    #[must_use]
    pub unsafe fn read(self) -> u64 {
        let (lo, hi): (u32, u32);
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") self.0,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }

    /// # Safety
    /// `wrmsr` is CPL0-only; the MSR must exist and accept `value`.
    #[cfg(feature = "asm")]
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn write(self, value: u64) {
        let lo = value as u32;
        let hi = (value >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") self.0,
                in("eax") lo,
                in("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}
