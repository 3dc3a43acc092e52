use bitfield_struct::bitfield;

/// CR4, restricted to the bits that select or affect the paging mode.
#[bitfield(u64, order = Lsb)]
pub struct Cr4 {
    /// Bits 0..4: VME, PVI, TSD, DE.
    #[bits(4)]
    pub misc_low: u8,

    /// Bit 4: PSE, 4 MiB pages in two-level paging.
    pub pse: bool,

    /// Bit 5: PAE, 64-bit entries (three levels, or four with `EFER.LMA`).
    pub pae: bool,

    /// Bit 6: MCE.
    pub mce: bool,

    /// Bit 7: PGE, global pages survive a root-register reload.
    pub pge: bool,

    /// Bits 8..17.
    #[bits(9)]
    pub misc_mid: u16,

    /// Bit 17: PCIDE.
    pub pcide: bool,

    #[bits(46)]
    pub misc_high: u64,
}

#[cfg(feature = "asm")]
impl crate::LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let cr4: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(feature = "asm")]
impl crate::StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_bits_sit_where_the_manual_says() {
        assert!(Cr4::from_bits(1 << 5).pae());
        assert!(Cr4::from_bits(1 << 4).pse());
        assert!(Cr4::from_bits(1 << 17).pcide());
        assert_eq!(Cr4::new().with_pge(true).into_bits(), 1 << 7);
    }
}
