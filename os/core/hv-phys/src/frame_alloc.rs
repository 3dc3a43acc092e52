use core::ptr::NonNull;
use hv_memory_addresses::PhysicalAddress;

/// Source of 4 KiB physical frames for page tables and backing pages.
///
/// Takes `&self`: allocators are shared between the address-space manager and
/// the cursors it opens, and must synchronize internally.
pub trait FrameAlloc {
    /// Allocate one 4 KiB-aligned frame; `None` when exhausted.
    ///
    /// The contents are unspecified; callers that need zeroes clear the frame.
    fn alloc_4k(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`FrameAlloc::alloc_4k`].
    fn free_4k(&self, pa: PhysicalAddress);
}

/// Converts physical addresses into pointers the hypervisor can dereference,
/// for the pages where such a mapping exists (identity map, direct map, …).
pub trait PhysMapper {
    /// Pointer to the byte at `pa`, or `None` if `pa` is not directly
    /// addressable. Dereferencing is the caller's responsibility: the page
    /// must stay mapped, and concurrent users must be synchronized.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> Option<NonNull<u8>>;
}

impl<T: FrameAlloc + ?Sized> FrameAlloc for &T {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        (**self).alloc_4k()
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        (**self).free_4k(pa);
    }
}
