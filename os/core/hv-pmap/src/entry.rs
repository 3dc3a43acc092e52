use bitfield_struct::bitfield;
use hv_memory_addresses::PhysicalAddress;

/// A page-table entry in its raw bitfield form.
///
/// This is the common superset of every level and every paging mode. 32-bit
/// entries of two-level paging use the low half with the same flag layout,
/// and their address field ends at bit 31.
///
/// | Bits   | Name      | Meaning |
/// |--------|-----------|---------|
/// | 0      | `P`       | present |
/// | 1      | `RW`      | writable |
/// | 2      | `US`      | user accessible |
/// | 3      | `PWT`     | write-through |
/// | 4      | `PCD`     | cache disable |
/// | 5      | `A`       | accessed |
/// | 6      | `D`       | dirty (leaf only) |
/// | 7      | `PS`      | large page (L2; L3 in long mode) |
/// | 8      | `G`       | global (leaf only) |
/// | 9      | `SHARED`  | software: page not owned by this address space |
/// | 10–11  | available | software |
/// | 12–51  | `addr`    | physical frame |
/// | 63     | `NX`      | execute disable |
///
/// ```rust
/// # use hv_memory_addresses::PhysicalAddress;
/// # use hv_pmap::PageEntryBits;
/// let e = PageEntryBits::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_physical_address(PhysicalAddress::new(0x12_3000));
/// assert_eq!(e.into_bits(), 0x12_3003);
/// ```
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,

    /// Set on mappings of memory this address space does not own
    /// (`map_shared`, `map_shared_physpage`); such pages are never freed
    /// through it.
    pub shared: bool,

    #[bits(2)]
    pub available: u8,

    #[bits(40)]
    frame: u64,

    #[bits(11)]
    pub available_high: u16,

    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Present, writable if `rw`, user-accessible, pointing at `pa`.
    #[inline]
    #[must_use]
    pub const fn user_page(pa: PhysicalAddress, rw: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(rw)
            .with_user(true)
            .with_physical_address(pa)
    }
}
