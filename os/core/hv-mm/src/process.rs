use crate::{MmError, ProcessLayout, Processor};
use alloc::vec::Vec;
use core::fmt;
use hv_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, Size4K, VirtualAddress, align_down, pages_spanned,
};
use hv_phys::{FrameAlloc, PhysAccess, PhysAttr, PhysMemory};
use hv_pmap::{Level, PageEntryBits, PagingMode, Pmap};
use hv_sync::SpinLock;
use log::{debug, trace};

/// Physical address of a process root table, as loaded into the root register.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ProcessRoot(PhysicalAddress);

impl ProcessRoot {
    #[must_use]
    pub const fn new(pa: PhysicalAddress) -> Self {
        Self(pa)
    }

    #[must_use]
    pub const fn phys(self) -> PhysicalAddress {
        self.0
    }

    /// Value for the root register.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }
}

impl fmt::Debug for ProcessRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessRoot({})", self.0)
    }
}

/// Address-space manager for process root tables.
///
/// Mapping operations act on the space currently loaded on `cpu`. `template`
/// is the hypervisor's own root; its entries at and above
/// [`ProcessLayout::user_end`] are copied into every new root.
pub struct ProcessMm<'m, M: ?Sized, A: ?Sized, P> {
    phys: PhysAccess<'m, M>,
    alloc: &'m A,
    cpu: P,
    layout: ProcessLayout,
    template: u64,
    lock: SpinLock<()>,
}

impl<'m, M, A, P> ProcessMm<'m, M, A, P>
where
    M: PhysMemory + ?Sized,
    A: FrameAlloc + ?Sized,
    P: Processor,
{
    #[must_use]
    pub const fn new(
        phys: PhysAccess<'m, M>,
        alloc: &'m A,
        cpu: P,
        layout: ProcessLayout,
        template: u64,
    ) -> Self {
        Self {
            phys,
            alloc,
            cpu,
            layout,
            template,
            lock: SpinLock::new(()),
        }
    }

    #[must_use]
    pub const fn layout(&self) -> &ProcessLayout {
        &self.layout
    }

    #[must_use]
    pub const fn cpu(&self) -> &P {
        &self.cpu
    }

    /// A fresh root: user half empty, hypervisor half copied from the template.
    ///
    /// # Errors
    /// [`MmError::OutOfMemory`].
    pub fn alloc(&self) -> Result<ProcessRoot, MmError> {
        let _g = self.lock.lock();
        let root = self.alloc.alloc_4k().ok_or(MmError::OutOfMemory)?;
        self.phys.zero_page(root, PhysAttr::WRITEBACK);

        let mode = self.mode();
        let src = mode.root_table(self.template);
        let size = mode.entry_size();
        for i in self.first_vmm_entry()..entries(mode, mode.top_level()) {
            let e = self.load(src + i * size);
            self.store(root + i * size, e);
        }
        debug!("mm: new process root {root}");
        Ok(ProcessRoot(root))
    }

    /// Release `root`, every page it owns and every table of its user half.
    ///
    /// `root` must not be active on any processor.
    pub fn free(&self, root: ProcessRoot) {
        let _g = self.lock.lock();
        let table = self.mode().root_table(root.as_u64());
        self.release(table, self.mode().top_level(), 0, self.first_vmm_entry());
        self.alloc.free_4k(root.phys());
        debug!("mm: freed process root {}", root.phys());
    }

    /// Back `[virt, virt + len)` (rounded to pages) with zeroed memory.
    ///
    /// # Errors
    /// - [`MmError::OutOfUserRange`] if the range leaves user space.
    /// - [`MmError::Overlap`] if any page is already mapped; nothing is
    ///   changed in that case.
    /// - [`MmError::OutOfMemory`]; pages mapped so far are released again.
    pub fn map_alloc(&self, virt: VirtualAddress, len: u64) -> Result<(), MmError> {
        let (start, end) = self.user_range(virt, len)?;
        let _g = self.lock.lock();
        let mut pmap = self.active()?;
        self.map_fresh(&mut pmap, start, end)
    }

    /// Remove every mapping in `[virt, virt + len)`, freeing owned pages.
    ///
    /// Page tables that become empty stay installed.
    ///
    /// # Errors
    /// [`MmError::OutOfUserRange`].
    pub fn unmap(&self, virt: VirtualAddress, len: u64) -> Result<(), MmError> {
        let (start, end) = self.user_range(virt, len)?;
        let _g = self.lock.lock();
        let mut pmap = self.active()?;
        self.unmap_range(&mut pmap, start, end);
        Ok(())
    }

    /// Drop the whole user half of the active space, tables included.
    pub fn unmapall(&self) {
        let _g = self.lock.lock();
        let mode = self.mode();
        let table = mode.root_table(self.cpu.root());
        self.release(table, mode.top_level(), 0, self.first_vmm_entry());
        self.cpu.flush();
    }

    /// Map a stack of `len` bytes (at least one page) at the highest free
    /// spot below [`ProcessLayout::stack_top`] that also leaves one unmapped
    /// guard page beneath it. Returns the stack top.
    ///
    /// # Errors
    /// [`MmError::NoVirtualSpace`], [`MmError::OutOfMemory`].
    pub fn map_stack(&self, len: u64) -> Result<VirtualAddress, MmError> {
        let pages = len.max(1).div_ceil(PAGE_SIZE);
        let _g = self.lock.lock();
        let mut pmap = self.active()?;

        let floor = self.layout.user_start().as_u64();
        let ceiling = self.layout.stack_top().as_u64();
        // Base of the lowest mapping seen so far. The page right below a
        // mapping is kept free as its guard.
        let mut top = ceiling;
        let mut va = top;
        let mut run = 0;
        while run < pages + 1 + u64::from(top != ceiling) {
            if va <= floor {
                return Err(MmError::NoVirtualSpace(len));
            }
            va -= PAGE_SIZE;
            if is_mapped(&mut pmap, va) {
                top = va;
                run = 0;
            } else {
                run += 1;
            }
        }
        if top != ceiling {
            top -= PAGE_SIZE;
        }

        let bottom = top - pages * PAGE_SIZE;
        self.map_fresh(&mut pmap, bottom, top)?;
        trace!("mm: stack [{bottom:#x}, {top:#x})");
        Ok(VirtualAddress::new(top))
    }

    /// Undo [`ProcessMm::map_stack`].
    ///
    /// # Errors
    /// [`MmError::OutOfUserRange`].
    pub fn unmapstack(&self, top: VirtualAddress, len: u64) -> Result<(), MmError> {
        let bottom = len
            .max(1)
            .div_ceil(PAGE_SIZE)
            .checked_mul(PAGE_SIZE)
            .and_then(|size| top.as_u64().checked_sub(size))
            .ok_or(MmError::OutOfUserRange(top))?;
        let size = top.as_u64() - bottom;
        self.unmap(VirtualAddress::new(bottom), size)
    }

    /// Map the foreign page `phys` at `virt` without taking ownership.
    ///
    /// # Errors
    /// [`MmError::OutOfUserRange`], [`MmError::Overlap`],
    /// [`MmError::OutOfMemory`].
    pub fn map_shared_physpage(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        rw: bool,
    ) -> Result<(), MmError> {
        let (start, _) = self.user_range(virt, PAGE_SIZE)?;
        let _g = self.lock.lock();
        let mut pmap = self.active()?;
        if is_mapped(&mut pmap, start) {
            return Err(MmError::Overlap(VirtualAddress::new(start)));
        }
        self.map_shared_page(&mut pmap, start, phys.align_down::<Size4K>(), rw)
    }

    /// Make `[other_virt, other_virt + len)` of the space rooted at `other`
    /// reachable from the active space, inside the shared window. Returns the
    /// address corresponding to `other_virt`. Unmap with
    /// [`ProcessMm::unmap`]; the memory stays owned by `other`.
    ///
    /// # Errors
    /// - [`MmError::NotMapped`] / [`MmError::ReadOnly`] if a page of the
    ///   source range is missing, or its leaf entry is not writable while `rw`.
    /// - [`MmError::NoVirtualSpace`] if the shared window is full.
    pub fn map_shared(
        &self,
        other: ProcessRoot,
        other_virt: VirtualAddress,
        len: u64,
        rw: bool,
    ) -> Result<VirtualAddress, MmError> {
        if other_virt.checked_add(len.max(1)).is_none() {
            return Err(MmError::NotMapped(other_virt));
        }
        let first = other_virt.align_down::<Size4K>().as_u64();
        let pages = pages_spanned(other_virt.as_u64(), len.max(1));

        let _g = self.lock.lock();
        let mut theirs = Pmap::open_guest(self.phys, other.as_u64(), self.mode().levels(), false)?;
        let frames = (0..pages)
            .map(|i| {
                let va = VirtualAddress::new(first + i * PAGE_SIZE);
                theirs.seek(va, Level::L1);
                let pa = theirs.translate().ok_or(MmError::NotMapped(va))?;
                if rw && !PageEntryBits::from_bits(theirs.read()).writable() {
                    return Err(MmError::ReadOnly(va));
                }
                Ok(pa)
            })
            .collect::<Result<Vec<_>, _>>()?;
        theirs.close();

        let mut pmap = self.active()?;
        let window = self.find_free(&mut pmap, self.layout.shared_start(), self.layout.user_end(), pages)?;
        for (va, pa) in page_range(window, window + pages * PAGE_SIZE).zip(frames) {
            if let Err(e) = self.map_shared_page(&mut pmap, va, pa, rw) {
                self.unmap_range(&mut pmap, window, va);
                return Err(e);
            }
        }
        Ok(VirtualAddress::new(window + other_virt.offset::<Size4K>()))
    }

    /// Load `new` as the active root with interrupts masked; returns the
    /// root that was active.
    pub fn switch(&self, new: ProcessRoot) -> ProcessRoot {
        self.cpu.without_interrupts(|| {
            let old = self.cpu.root();
            self.cpu.set_root(new.as_u64());
            ProcessRoot(PhysicalAddress::new(old))
        })
    }

    const fn mode(&self) -> PagingMode {
        self.layout.mode()
    }

    /// Index of the first root entry belonging to the hypervisor.
    fn first_vmm_entry(&self) -> u64 {
        self.layout.user_end().as_u64() / self.mode().span(self.mode().top_level())
    }

    fn active(&self) -> Result<Pmap<'m, M>, MmError> {
        Ok(Pmap::open_vmm(self.phys, self.cpu.root(), self.mode().levels())?)
    }

    fn user_range(&self, virt: VirtualAddress, len: u64) -> Result<(u64, u64), MmError> {
        let start = align_down(virt.as_u64(), PAGE_SIZE);
        let end = virt
            .as_u64()
            .checked_add(len)
            .and_then(|e| e.checked_add(PAGE_SIZE - 1))
            .map(|e| align_down(e, PAGE_SIZE))
            .ok_or(MmError::OutOfUserRange(virt))?;
        if self.layout.contains(start, end) {
            Ok((start, end))
        } else {
            Err(MmError::OutOfUserRange(virt))
        }
    }

    fn map_fresh(&self, pmap: &mut Pmap<'m, M>, start: u64, end: u64) -> Result<(), MmError> {
        if let Some(va) = page_range(start, end).find(|va| is_mapped(pmap, *va)) {
            return Err(MmError::Overlap(VirtualAddress::new(va)));
        }
        for va in page_range(start, end) {
            if let Err(e) = self.map_owned_page(pmap, va) {
                self.unmap_range(pmap, start, va);
                return Err(e);
            }
        }
        Ok(())
    }

    fn map_owned_page(&self, pmap: &mut Pmap<'m, M>, va: u64) -> Result<(), MmError> {
        pmap.seek(VirtualAddress::new(va), Level::L1);
        pmap.autoalloc(self.alloc)?;
        let frame = self.alloc.alloc_4k().ok_or(MmError::OutOfMemory)?;
        self.phys.zero_page(frame, PhysAttr::WRITEBACK);
        let entry = PageEntryBits::user_page(frame, true).into_bits();
        pmap.write(entry, u64::MAX).inspect_err(|_| self.alloc.free_4k(frame))?;
        Ok(())
    }

    fn map_shared_page(
        &self,
        pmap: &mut Pmap<'m, M>,
        va: u64,
        pa: PhysicalAddress,
        rw: bool,
    ) -> Result<(), MmError> {
        pmap.seek(VirtualAddress::new(va), Level::L1);
        pmap.autoalloc(self.alloc)?;
        let entry = PageEntryBits::user_page(pa, rw).with_shared(true).into_bits();
        pmap.write(entry, u64::MAX)?;
        Ok(())
    }

    fn unmap_range(&self, pmap: &mut Pmap<'m, M>, start: u64, end: u64) {
        for va in page_range(start, end) {
            pmap.seek(VirtualAddress::new(va), Level::L1);
            if pmap.read_level() != Level::L1 {
                continue;
            }
            let e = PageEntryBits::from_bits(pmap.read());
            if !e.present() {
                continue;
            }
            if let Err(err) = pmap.clear() {
                debug!("mm: leaving {va:#x} mapped: {err}");
                continue;
            }
            self.cpu.invalidate(VirtualAddress::new(va));
            // Only once no translation can reach it.
            if !e.shared() {
                self.alloc.free_4k(e.physical_address());
            }
        }
    }

    /// First-fit search for `pages` unmapped pages in `[from, to)`.
    fn find_free(
        &self,
        pmap: &mut Pmap<'m, M>,
        from: VirtualAddress,
        to: VirtualAddress,
        pages: u64,
    ) -> Result<u64, MmError> {
        let mut start = from.as_u64();
        let mut va = start;
        while va < to.as_u64() {
            if is_mapped(pmap, va) {
                start = va + PAGE_SIZE;
            } else if (va + PAGE_SIZE - start) / PAGE_SIZE == pages {
                return Ok(start);
            }
            va += PAGE_SIZE;
        }
        Err(MmError::NoVirtualSpace(pages * PAGE_SIZE))
    }

    /// Free what the entries `[first, last)` of the table at `level` reach:
    /// owned 4 KiB pages and the tables themselves. Clears the entries.
    fn release(&self, table: PhysicalAddress, level: Level, first: u64, last: u64) {
        let mode = self.mode();
        for i in first..last {
            let slot = table + i * mode.entry_size();
            let raw = self.load(slot);
            let e = PageEntryBits::from_bits(raw);
            if !e.present() {
                continue;
            }
            if !mode.is_leaf(raw, level) {
                let child = mode.table_address(raw);
                if let Some(below) = level.below() {
                    self.release(child, below, 0, entries(mode, below));
                }
                self.alloc.free_4k(child);
            } else if level == Level::L1 && !e.shared() {
                self.alloc.free_4k(PhysicalAddress::new(raw & mode.address_mask()));
            }
            self.store(slot, 0);
        }
    }

    fn load(&self, pa: PhysicalAddress) -> u64 {
        match self.mode() {
            PagingMode::TwoLevel => u64::from(self.phys.read_l(pa, PhysAttr::WRITEBACK)),
            PagingMode::Pae | PagingMode::LongMode => self.phys.read_q(pa, PhysAttr::WRITEBACK),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn store(&self, pa: PhysicalAddress, value: u64) {
        match self.mode() {
            PagingMode::TwoLevel => self.phys.write_l(pa, value as u32, PhysAttr::WRITEBACK),
            PagingMode::Pae | PagingMode::LongMode => self.phys.write_q(pa, value, PhysAttr::WRITEBACK),
        }
    }
}

/// Page bases in `[start, end)`; both page-aligned.
fn page_range(start: u64, end: u64) -> impl Iterator<Item = u64> {
    (0..(end - start) / PAGE_SIZE).map(move |i| start + i * PAGE_SIZE)
}

/// Entries per table at `level`.
const fn entries(mode: PagingMode, level: Level) -> u64 {
    1 << mode.index_width(level)
}

/// Whether anything (a 4 KiB leaf or a large page) maps `va`.
fn is_mapped<M: PhysMemory + ?Sized>(pmap: &mut Pmap<'_, M>, va: u64) -> bool {
    pmap.seek(VirtualAddress::new(va), Level::L1);
    PageEntryBits::from_bits(pmap.read()).present()
}
