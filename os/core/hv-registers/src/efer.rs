use crate::msr::Msr;
use bitfield_struct::bitfield;

/// `IA32_EFER` (MSR `0xC000_0080`), restricted to the long-mode bits.
#[bitfield(u64, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Efer {
    /// Bit 0: SCE.
    pub sce: bool,

    #[bits(7)]
    pub reserved0: u8,

    /// Bit 8: LME, long mode enable.
    pub lme: bool,

    #[bits(access = RO)]
    pub reserved1: bool,

    /// Bit 10: LMA, long mode active. With `CR4.PAE` this selects four-level
    /// paging.
    pub lma: bool,

    /// Bit 11: NXE, honour the execute-disable bit in 64-bit entries.
    pub nxe: bool,

    #[bits(52)]
    pub misc_high: u64,
}

impl Efer {
    pub const MSR: Msr = Msr::IA32_EFER;
}

#[cfg(feature = "asm")]
impl crate::LoadRegisterUnsafe for Efer {
    unsafe fn load_unsafe() -> Self {
        Self::from_bits(unsafe { Self::MSR.read() })
    }
}

#[cfg(feature = "asm")]
impl crate::StoreRegisterUnsafe for Efer {
    unsafe fn store_unsafe(self) {
        unsafe { Self::MSR.write(self.into_bits()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_mode_bits() {
        let efer = Efer::from_bits(0x0000_0000_0000_0D01);
        assert!(efer.sce());
        assert!(efer.lme());
        assert!(efer.lma());
        assert!(efer.nxe());
    }
}
