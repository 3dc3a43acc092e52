use bitfield_struct::bitfield;
use hv_memory_addresses::PhysicalAddress;

/// CR3, the root-table register.
///
/// The base field covers bits 12..52, which is the layout of two-level and
/// long-mode paging. In PAE mode the PDPT base is only 32-byte aligned
/// (bits 5..32); use [`Cr3::into_bits`] and mask it yourself there, as the
/// page-map cursor does.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Cr3 {
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT, write-through for the root table.
    pub pwt: bool,

    /// Bit 4: PCD, cache disable for the root table.
    pub pcd: bool,

    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12..52: root table physical base >> 12.
    #[bits(40)]
    root_4k: u64,

    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// `root` must be 4 KiB-aligned.
    #[must_use]
    pub fn from_root(root: PhysicalAddress) -> Self {
        debug_assert_eq!(root.as_u64() & 0xFFF, 0, "root table must be 4K-aligned");
        Self::new().with_root_4k(root.as_u64() >> 12)
    }

    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_4k() << 12)
    }
}

#[cfg(feature = "asm")]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
