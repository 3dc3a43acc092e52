//! TLB maintenance on the current processor.

use crate::{Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe};
use hv_memory_addresses::VirtualAddress;

/// Drop the translation for the page containing `va`.
///
/// # Safety
/// CPL0 only.
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Drop all non-global translations by reloading CR3.
///
/// # Safety
/// CPL0 only.
#[inline]
pub unsafe fn flush_all() {
    unsafe { Cr3::load_unsafe().store_unsafe() }
}
