//! Paging-mode geometry.
//!
//! | levels | mode | entry | root register mask | index bits |
//! |---|---|---|---|---|
//! | 2 | [`PagingMode::TwoLevel`] | 4 B | `0xFFFF_F000` | L2 `[31:22]`, L1 `[21:12]` |
//! | 3 | [`PagingMode::Pae`] | 8 B | `0xFFFF_FFE0` | L3 `[31:30]`, L2 `[29:21]`, L1 `[20:12]` |
//! | 4 | [`PagingMode::LongMode`] | 8 B | `0x000F_FFFF_FFFF_F000` | L4 `[47:39]` … L1 `[20:12]` |
//!
//! Large pages: two-level L2 (4 MiB), PAE L2 (2 MiB), long-mode L2 (2 MiB)
//! and L3 (1 GiB). PAE PDPT entries never map pages.

use crate::{Level, PageEntryBits, PmapError};
use hv_memory_addresses::{PhysicalAddress, VirtualAddress};

const ADDR_MASK_32: u64 = 0xFFFF_F000;
const ADDR_MASK_64: u64 = 0x000F_FFFF_FFFF_F000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PagingMode {
    /// Classic 32-bit paging, 1024 four-byte entries per table.
    TwoLevel,
    /// 32-bit PAE: a four-entry PDPT above two 512-entry levels.
    Pae,
    /// IA-32e four-level paging.
    LongMode,
}

impl PagingMode {
    /// # Errors
    /// [`PmapError::InvalidLevels`] unless `levels` is 2, 3 or 4.
    pub const fn from_levels(levels: u8) -> Result<Self, PmapError> {
        match levels {
            2 => Ok(Self::TwoLevel),
            3 => Ok(Self::Pae),
            4 => Ok(Self::LongMode),
            n => Err(PmapError::InvalidLevels(n)),
        }
    }

    #[must_use]
    pub const fn levels(self) -> u8 {
        match self {
            Self::TwoLevel => 2,
            Self::Pae => 3,
            Self::LongMode => 4,
        }
    }

    /// The root pseudo-level, one above the top table.
    #[must_use]
    pub const fn root_level(self) -> Level {
        Level::root(self.levels())
    }

    /// The top table's level.
    #[must_use]
    pub const fn top_level(self) -> Level {
        Level::root(self.levels() - 1)
    }

    #[must_use]
    pub const fn entry_size(self) -> u64 {
        match self {
            Self::TwoLevel => 4,
            Self::Pae | Self::LongMode => 8,
        }
    }

    /// Address field of a table-pointing or 4 KiB entry.
    #[must_use]
    pub const fn address_mask(self) -> u64 {
        match self {
            Self::TwoLevel => ADDR_MASK_32,
            Self::Pae | Self::LongMode => ADDR_MASK_64,
        }
    }

    /// Bits an entry of this mode can hold.
    #[must_use]
    pub const fn entry_mask(self) -> u64 {
        match self {
            Self::TwoLevel => 0xFFFF_FFFF,
            Self::Pae | Self::LongMode => u64::MAX,
        }
    }

    /// Physical address of the top table from the root register value.
    #[must_use]
    pub const fn root_table(self, root: u64) -> PhysicalAddress {
        PhysicalAddress::new(match self {
            Self::TwoLevel => root & ADDR_MASK_32,
            Self::Pae => root & 0xFFFF_FFE0,
            Self::LongMode => root & ADDR_MASK_64,
        })
    }

    /// Physical address of the table an intermediate entry points to.
    #[must_use]
    pub const fn table_address(self, entry: u64) -> PhysicalAddress {
        PhysicalAddress::new(entry & self.address_mask())
    }

    /// Lowest virtual-address bit decoded at `level`.
    #[must_use]
    pub const fn index_shift(self, level: Level) -> u32 {
        match (self, level.get()) {
            (_, 1) => 12,
            (Self::TwoLevel, _) => 22,
            (_, l) => 21 + 9 * (l as u32 - 2),
        }
    }

    /// Number of virtual-address bits decoded at `level`.
    #[must_use]
    pub const fn index_width(self, level: Level) -> u32 {
        match (self, level.get()) {
            (Self::TwoLevel, _) => 10,
            (Self::Pae, 3) => 2,
            _ => 9,
        }
    }

    /// Index of `virt` in the table at `level`.
    #[must_use]
    pub const fn index(self, virt: VirtualAddress, level: Level) -> u64 {
        virt.bits(self.index_shift(level), self.index_width(level))
    }

    /// Bytes of virtual space one entry at `level` covers.
    #[must_use]
    pub const fn span(self, level: Level) -> u64 {
        1 << self.index_shift(level)
    }

    /// Whether an entry at `level` may map a page directly (`PS`).
    #[must_use]
    pub const fn large_page_allowed(self, level: Level) -> bool {
        matches!(
            (self, level.get()),
            (_, 2) | (Self::LongMode, 3)
        )
    }

    /// Whether `entry` at `level` maps a page rather than a table.
    #[must_use]
    pub const fn is_leaf(self, entry: u64, level: Level) -> bool {
        level.get() == 1
            || (self.large_page_allowed(level) && PageEntryBits::from_bits(entry).large_page())
    }

    /// Address field of a leaf entry at `level`.
    #[must_use]
    pub const fn leaf_mask(self, level: Level) -> u64 {
        if level.get() == 1 {
            self.address_mask()
        } else {
            self.address_mask() & !(self.span(level) - 1)
        }
    }

    /// Flags for a freshly installed intermediate entry at `level`.
    ///
    /// PAE PDPT entries reserve RW and US, so those only get `P`.
    #[must_use]
    pub const fn intermediate_flags(self, level: Level) -> u64 {
        let p = PageEntryBits::new().with_present(true);
        match (self, level.get()) {
            (Self::Pae, 3) => p.into_bits(),
            _ => p.with_writable(true).with_user(true).into_bits(),
        }
    }

    /// Resolve `virt` through a leaf `entry` found at `level`.
    ///
    /// `None` if the entry is not present or points at a further table.
    #[must_use]
    pub const fn translate(self, entry: u64, level: Level, virt: VirtualAddress) -> Option<PhysicalAddress> {
        if !PageEntryBits::from_bits(entry).present() || !self.is_leaf(entry, level) {
            return None;
        }
        let offset = virt.as_u64() & (self.span(level) - 1);
        Some(PhysicalAddress::new((entry & self.leaf_mask(level)) | offset))
    }

    /// The mode the current processor is paging with.
    ///
    /// # Safety
    /// Reads CR4 and `IA32_EFER`; CPL0 only, paging must be enabled.
    #[cfg(feature = "asm")]
    #[must_use]
    pub unsafe fn detect() -> Self {
        use hv_registers::{Cr4, Efer, LoadRegisterUnsafe};
        let cr4 = unsafe { Cr4::load_unsafe() };
        if !cr4.pae() {
            return Self::TwoLevel;
        }
        if unsafe { Efer::load_unsafe() }.lma() {
            Self::LongMode
        } else {
            Self::Pae
        }
    }
}
