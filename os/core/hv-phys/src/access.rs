use crate::{PhysAttr, PhysError, PhysMemory};
use hv_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::trace;

const FRAME_BYTES: usize = 4096;

/// Value every load from unbacked physical memory returns, truncated to the
/// access width.
pub const PHYS_FILL: u64 = u64::MAX;

/// Width-typed loads, stores and compare-and-swap over a [`PhysMemory`].
///
/// Cheap to copy; holds only a reference to the store. Values are
/// little-endian, addresses need not be aligned.
pub struct PhysAccess<'m, M: ?Sized> {
    mem: &'m M,
}

impl<M: ?Sized> Clone for PhysAccess<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: ?Sized> Copy for PhysAccess<'_, M> {}

macro_rules! load_store {
    ($read:ident, $write:ident, $ty:ty) => {
        #[inline]
        #[must_use]
        pub fn $read(&self, pa: PhysicalAddress, attr: PhysAttr) -> $ty {
            <$ty>::from_le_bytes(self.load(pa, attr))
        }

        #[inline]
        pub fn $write(&self, pa: PhysicalAddress, value: $ty, attr: PhysAttr) {
            self.store(pa, &value.to_le_bytes(), attr);
        }
    };
}

impl<'m, M: PhysMemory + ?Sized> PhysAccess<'m, M> {
    #[must_use]
    pub const fn new(mem: &'m M) -> Self {
        Self { mem }
    }

    #[must_use]
    pub const fn memory(&self) -> &'m M {
        self.mem
    }

    load_store!(read_b, write_b, u8);
    load_store!(read_w, write_w, u16);
    load_store!(read_l, write_l, u32);
    load_store!(read_q, write_q, u64);

    /// 32-bit compare-and-swap, shaped like [`core::sync::atomic::AtomicU32::compare_exchange`].
    ///
    /// # Errors
    /// The value actually observed when it differs from `current`;
    /// the fill value if nothing backs `pa`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn cmpxchg_l(
        &self,
        pa: PhysicalAddress,
        current: u32,
        new: u32,
        attr: PhysAttr,
    ) -> Result<u32, u32> {
        match self.mem.compare_exchange_u32(pa, current, new, attr) {
            Ok(seen) if seen == current => Ok(seen),
            Ok(seen) => Err(seen),
            Err(e) => {
                unbacked("cmpxchg_l", e);
                Err(PHYS_FILL as u32)
            }
        }
    }

    /// 64-bit compare-and-swap, shaped like [`core::sync::atomic::AtomicU64::compare_exchange`].
    ///
    /// # Errors
    /// The value actually observed when it differs from `current`;
    /// the fill value if nothing backs `pa`.
    pub fn cmpxchg_q(
        &self,
        pa: PhysicalAddress,
        current: u64,
        new: u64,
        attr: PhysAttr,
    ) -> Result<u64, u64> {
        match self.mem.compare_exchange_u64(pa, current, new, attr) {
            Ok(seen) if seen == current => Ok(seen),
            Ok(seen) => Err(seen),
            Err(e) => {
                unbacked("cmpxchg_q", e);
                Err(PHYS_FILL)
            }
        }
    }

    /// Zero the 4 KiB frame at `pa` (which must be page-aligned).
    pub fn zero_page(&self, pa: PhysicalAddress, attr: PhysAttr) {
        debug_assert_eq!(pa.as_u64() % PAGE_SIZE, 0);
        self.store(pa, &[0; FRAME_BYTES], attr);
    }

    /// Copy `buf.len()` bytes from `pa`; unbacked ranges read as fill bytes.
    pub fn read_bytes(&self, pa: PhysicalAddress, buf: &mut [u8], attr: PhysAttr) {
        if let Err(e) = self.mem.read(pa, buf, attr) {
            unbacked("read", e);
            buf.fill(0xFF);
        }
    }

    pub fn write_bytes(&self, pa: PhysicalAddress, buf: &[u8], attr: PhysAttr) {
        self.store(pa, buf, attr);
    }

    fn load<const N: usize>(&self, pa: PhysicalAddress, attr: PhysAttr) -> [u8; N] {
        let mut buf = [0; N];
        self.read_bytes(pa, &mut buf, attr);
        buf
    }

    fn store(&self, pa: PhysicalAddress, buf: &[u8], attr: PhysAttr) {
        if let Err(e) = self.mem.write(pa, buf, attr) {
            unbacked("write", e);
        }
    }
}

#[inline]
fn unbacked(op: &str, e: PhysError) {
    trace!("phys {op}: {e}");
}

#[cfg(all(test, feature = "ram"))]
mod tests {
    use super::*;
    use crate::{FrameAlloc, SparseRam};

    #[test]
    fn unbacked_reads_fill_and_writes_drop() {
        let ram = SparseRam::new();
        let phys = PhysAccess::new(&ram);
        let pa = PhysicalAddress::new(0xDEAD_0000);

        assert_eq!(phys.read_b(pa, PhysAttr::WRITEBACK), 0xFF);
        assert_eq!(phys.read_w(pa, PhysAttr::WRITEBACK), 0xFFFF);
        assert_eq!(phys.read_l(pa, PhysAttr::UNCACHED), 0xFFFF_FFFF);
        assert_eq!(phys.read_q(pa, PhysAttr::ATOMIC), u64::MAX);

        phys.write_q(pa, 0, PhysAttr::WRITEBACK);
        assert_eq!(phys.read_q(pa, PhysAttr::WRITEBACK), u64::MAX);
        assert_eq!(ram.live_frames(), 0);

        assert_eq!(phys.cmpxchg_q(pa, u64::MAX, 0, PhysAttr::ATOMIC), Err(u64::MAX));
        assert_eq!(phys.cmpxchg_l(pa, 0, 1, PhysAttr::ATOMIC), Err(u32::MAX));
    }

    #[test]
    fn accesses_at_the_top_of_memory_are_inert() {
        let ram = SparseRam::new();
        let phys = PhysAccess::new(&ram);
        let pa = PhysicalAddress::new(u64::MAX - 3);

        assert_eq!(phys.read_q(pa, PhysAttr::WRITEBACK), PHYS_FILL);
        assert_eq!(phys.read_l(pa, PhysAttr::WRITEBACK), 0xFFFF_FFFF);
        phys.write_q(pa, 0, PhysAttr::WRITEBACK);
        assert_eq!(ram.live_frames(), 0);
    }

    #[test]
    fn widths_are_little_endian_and_unaligned() {
        let ram = SparseRam::new();
        let frame = ram.alloc_4k().expect("frame");
        let phys = PhysAccess::new(&ram);

        phys.write_q(frame + 3, 0x1122_3344_5566_7788, PhysAttr::WRITEBACK);
        assert_eq!(phys.read_b(frame + 3, PhysAttr::WRITEBACK), 0x88);
        assert_eq!(phys.read_w(frame + 4, PhysAttr::WRITEBACK), 0x6677);
        assert_eq!(phys.read_w(frame + 5, PhysAttr::WRITEBACK), 0x5566);
        assert_eq!(phys.read_l(frame + 7, PhysAttr::WRITEBACK), 0x1122_3344);

        phys.write_w(frame + 3, 0xABCD, PhysAttr::WRITEBACK);
        assert_eq!(phys.read_q(frame + 3, PhysAttr::WRITEBACK), 0x1122_3344_5566_ABCD);
    }

    #[test]
    fn cmpxchg_reports_observed_value() {
        let ram = SparseRam::new();
        let frame = ram.alloc_4k().expect("frame");
        let phys = PhysAccess::new(&ram);

        phys.write_l(frame, 7, PhysAttr::WRITEBACK);
        assert_eq!(phys.cmpxchg_l(frame, 6, 9, PhysAttr::ATOMIC), Err(7));
        assert_eq!(phys.cmpxchg_l(frame, 7, 9, PhysAttr::ATOMIC), Ok(7));
        assert_eq!(phys.read_l(frame, PhysAttr::WRITEBACK), 9);

        // Non-atomic attribute still performs the exchange, just not atomically.
        assert_eq!(phys.cmpxchg_q(frame + 8, 0, 5, PhysAttr::WRITEBACK), Ok(0));
        assert_eq!(phys.read_q(frame + 8, PhysAttr::WRITEBACK), 5);
    }

    #[test]
    fn zero_page_clears_the_whole_frame() {
        let ram = SparseRam::new();
        let frame = ram.alloc_4k().expect("frame");
        let phys = PhysAccess::new(&ram);
        phys.write_q(frame, u64::MAX, PhysAttr::WRITEBACK);
        phys.write_q(frame + 4088, u64::MAX, PhysAttr::WRITEBACK);
        phys.zero_page(frame, PhysAttr::WRITEBACK);
        assert_eq!(phys.read_q(frame, PhysAttr::WRITEBACK), 0);
        assert_eq!(phys.read_q(frame + 4088, PhysAttr::WRITEBACK), 0);
    }
}
