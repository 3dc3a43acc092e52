use crate::{Level, LevelArray, PageEntryBits, PagingMode, PmapError};
use core::fmt;
use core::ptr::NonNull;
use hv_memory_addresses::{PhysicalAddress, VirtualAddress};
use hv_phys::{FrameAlloc, PhysAccess, PhysAttr, PhysMapper, PhysMemory};
use log::{debug, trace};

/// Whose tables a cursor walks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PmapRole {
    /// The hypervisor's own tables. Callers provide any serialization.
    Vmm,
    /// A guest's (or process') tables. With `atomic`, loads are atomic and
    /// stores are compare-and-swap against the last observed value.
    Guest { atomic: bool },
}

impl PmapRole {
    const fn atomic(self) -> bool {
        match self {
            Self::Vmm => false,
            Self::Guest { atomic } => atomic,
        }
    }

    const fn attr(self) -> PhysAttr {
        if self.atomic() {
            PhysAttr::ATOMIC
        } else {
            PhysAttr::WRITEBACK
        }
    }
}

/// Directly addressable entry slot, typed by the entry width of the mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryPtr {
    Entry32(NonNull<u32>),
    Entry64(NonNull<u64>),
}

/// Page-table cursor.
///
/// `entry[root]` holds the root register value; `entry[l]` for lower levels
/// holds the entry loaded at that level during the last walk, and
/// `entryaddr[l]` its physical address. Entries from `curlevel` up to the
/// root are valid for `curaddr`.
pub struct Pmap<'m, M: ?Sized> {
    phys: PhysAccess<'m, M>,
    mode: PagingMode,
    role: PmapRole,
    entry: LevelArray<u64, 5>,
    entryaddr: LevelArray<PhysicalAddress, 4>,
    curaddr: VirtualAddress,
    /// Deepest level loaded by the last walk.
    curlevel: Level,
    /// Level the caller asked for.
    readlevel: Level,
}

impl<'m, M: PhysMemory + ?Sized> Pmap<'m, M> {
    /// Cursor over the hypervisor's own tables.
    ///
    /// `root` is the root register value (e.g. CR3), not just the table
    /// address: PAE roots are only 32-byte aligned.
    ///
    /// # Errors
    /// [`PmapError::InvalidLevels`] unless `levels` is 2, 3 or 4.
    pub fn open_vmm(phys: PhysAccess<'m, M>, root: u64, levels: u8) -> Result<Self, PmapError> {
        Self::open(phys, root, levels, PmapRole::Vmm)
    }

    /// Cursor over a guest's tables; see [`PmapRole::Guest`].
    ///
    /// # Errors
    /// [`PmapError::InvalidLevels`] unless `levels` is 2, 3 or 4.
    pub fn open_guest(
        phys: PhysAccess<'m, M>,
        root: u64,
        levels: u8,
        atomic: bool,
    ) -> Result<Self, PmapError> {
        Self::open(phys, root, levels, PmapRole::Guest { atomic })
    }

    /// # Errors
    /// [`PmapError::InvalidLevels`] unless `levels` is 2, 3 or 4.
    pub fn open(
        phys: PhysAccess<'m, M>,
        root: u64,
        levels: u8,
        role: PmapRole,
    ) -> Result<Self, PmapError> {
        let mode = PagingMode::from_levels(levels)?;
        let top = mode.root_level();
        let mut entry = LevelArray::filled(0);
        entry[top] = root;
        Ok(Self {
            phys,
            mode,
            role,
            entry,
            entryaddr: LevelArray::filled(PhysicalAddress::zero()),
            curaddr: VirtualAddress::zero(),
            curlevel: top,
            readlevel: top,
        })
    }

    /// Drop the cursor. The tables are untouched.
    pub fn close(self) {
        trace!("pmap: close {:?} at {}", self.role, self.curaddr);
    }

    #[must_use]
    pub const fn mode(&self) -> PagingMode {
        self.mode
    }

    #[must_use]
    pub const fn role(&self) -> PmapRole {
        self.role
    }

    /// The root register value this cursor walks from.
    #[must_use]
    pub fn root(&self) -> u64 {
        self.entry[self.mode.root_level()]
    }

    #[must_use]
    pub const fn curaddr(&self) -> VirtualAddress {
        self.curaddr
    }

    /// Change the requested depth at the current address.
    ///
    /// Raising it only forgets the deeper entries; lowering it continues the
    /// walk from where the last one stopped.
    pub fn set_level(&mut self, level: Level) {
        let level = self.clamp(level);
        self.readlevel = level;
        if level > self.curlevel {
            self.curlevel = level;
        } else {
            self.walk();
        }
    }

    /// Position the cursor at `virt` and walk down to `level`.
    ///
    /// The walk stops early at a non-present entry or at a large-page leaf;
    /// [`Pmap::read_level`] tells where. Entries of the previous walk that sit
    /// strictly above where it stopped and whose index bits are unchanged are
    /// reused without a reload.
    pub fn seek(&mut self, virt: VirtualAddress, level: Level) {
        let level = self.clamp(level);
        let mut keep = self.mode.root_level();
        let mut l = self.mode.top_level();
        while l > self.curlevel && l >= level {
            if self.mode.index(virt, l) != self.mode.index(self.curaddr, l) {
                break;
            }
            keep = l;
            match l.below() {
                Some(below) => l = below,
                None => break,
            }
        }
        self.curlevel = keep;
        self.curaddr = virt;
        self.readlevel = level;
        self.walk();
    }

    /// Level the last walk actually reached (`>=` the requested one).
    #[must_use]
    pub const fn read_level(&self) -> Level {
        self.curlevel
    }

    /// Entry at [`Pmap::read_level`].
    #[must_use]
    pub fn read(&self) -> u64 {
        self.entry[self.curlevel]
    }

    /// Physical address of the entry at [`Pmap::read_level`]; `None` at the
    /// root pseudo-level.
    #[must_use]
    pub fn entry_address(&self) -> Option<PhysicalAddress> {
        (self.curlevel < self.mode.root_level()).then(|| self.entryaddr[self.curlevel])
    }

    /// Resolve [`Pmap::curaddr`] through the entry at [`Pmap::read_level`],
    /// if that entry is a present leaf.
    #[must_use]
    pub fn translate(&self) -> Option<PhysicalAddress> {
        if self.curlevel == self.mode.root_level() {
            return None;
        }
        self.mode.translate(self.read(), self.curlevel, self.curaddr)
    }

    /// Store into the current slot.
    ///
    /// The address field comes from `entry`; flag bits come from `entry`
    /// where `attrmask` is set and keep their current value elsewhere.
    ///
    /// # Errors
    /// - [`PmapError::NoParentTable`] if the walk did not reach the requested
    ///   level (or the requested level is the root register).
    /// - [`PmapError::Raced`] if an atomic cursor lost the compare-and-swap;
    ///   [`Pmap::read`] then returns the winning value.
    pub fn write(&mut self, entry: u64, attrmask: u64) -> Result<(), PmapError> {
        let level = self.slot()?;
        let addr = self.mode.address_mask();
        let old = self.entry[level];
        let new = (entry & addr) | (entry & attrmask & !addr) | (old & !attrmask & !addr);
        self.store(level, new)
    }

    /// Zero the current slot. Tables below it are not freed.
    ///
    /// # Errors
    /// As for [`Pmap::write`].
    pub fn clear(&mut self) -> Result<(), PmapError> {
        let level = self.slot()?;
        self.store(level, 0)
    }

    /// Install zero-filled tables wherever the walk stopped on a non-present
    /// entry, until the requested level is reached.
    ///
    /// # Errors
    /// - [`PmapError::OutOfMemory`] if `alloc` is exhausted; tables installed
    ///   so far stay in place.
    /// - [`PmapError::LargePage`] if a large-page leaf sits above the
    ///   requested level.
    /// - [`PmapError::Raced`] if an atomic install lost; the fresh table is
    ///   returned to `alloc`.
    pub fn autoalloc<A: FrameAlloc + ?Sized>(&mut self, alloc: &A) -> Result<(), PmapError> {
        self.walk();
        while self.curlevel > self.readlevel {
            let level = self.curlevel;
            if PageEntryBits::from_bits(self.entry[level]).present() {
                return Err(PmapError::LargePage);
            }
            let table = alloc.alloc_4k().ok_or(PmapError::OutOfMemory)?;
            debug_assert_eq!(table.as_u64() & !self.mode.address_mask(), 0);
            self.phys.zero_page(table, PhysAttr::WRITEBACK);
            let new = table.as_u64() | self.mode.intermediate_flags(level);
            if let Err(e) = self.store(level, new) {
                alloc.free_4k(table);
                return Err(e);
            }
            trace!("pmap: new {level} table {table} for {}", self.curaddr);
            self.walk();
        }
        Ok(())
    }

    /// Where the entry at the requested level lives in the hypervisor's
    /// address space, if `mapper` can address it.
    #[must_use]
    pub fn pointer<P: PhysMapper + ?Sized>(&self, mapper: &P) -> Option<EntryPtr> {
        let level = self.slot().ok()?;
        let p = mapper.phys_to_ptr(self.entryaddr[level])?;
        Some(match self.mode {
            PagingMode::TwoLevel => EntryPtr::Entry32(p.cast()),
            PagingMode::Pae | PagingMode::LongMode => EntryPtr::Entry64(p.cast()),
        })
    }

    /// Snapshot of the current walk, also logged at `debug`.
    #[must_use]
    pub fn dump(&self) -> PmapTrace {
        let trace = PmapTrace {
            mode: self.mode,
            virt: self.curaddr,
            entry: self.entry,
            entryaddr: self.entryaddr,
            reached: self.curlevel,
            requested: self.readlevel,
        };
        debug!("{trace}");
        trace
    }

    fn clamp(&self, level: Level) -> Level {
        level.min(self.mode.root_level())
    }

    fn slot(&self) -> Result<Level, PmapError> {
        if self.curlevel != self.readlevel || self.curlevel == self.mode.root_level() {
            return Err(PmapError::NoParentTable);
        }
        Ok(self.curlevel)
    }

    /// Descend from `curlevel` towards `readlevel`.
    fn walk(&mut self) {
        let root = self.mode.root_level();
        while self.curlevel > self.readlevel {
            let level = self.curlevel;
            let e = self.entry[level];
            let table = if level == root {
                self.mode.root_table(e)
            } else if !PageEntryBits::from_bits(e).present() || self.mode.is_leaf(e, level) {
                break;
            } else {
                self.mode.table_address(e)
            };
            let Some(child) = level.below() else { break };
            let addr = table + self.mode.index(self.curaddr, child) * self.mode.entry_size();
            self.entryaddr[child] = addr;
            self.entry[child] = self.load(addr);
            self.curlevel = child;
        }
    }

    fn load(&self, addr: PhysicalAddress) -> u64 {
        let attr = self.role.attr();
        match self.mode {
            PagingMode::TwoLevel => u64::from(self.phys.read_l(addr, attr)),
            PagingMode::Pae | PagingMode::LongMode => self.phys.read_q(addr, attr),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn store(&mut self, level: Level, new: u64) -> Result<(), PmapError> {
        let addr = self.entryaddr[level];
        let new = new & self.mode.entry_mask();
        let attr = self.role.attr();
        if self.role.atomic() {
            let old = self.entry[level];
            let result = match self.mode {
                PagingMode::TwoLevel => self
                    .phys
                    .cmpxchg_l(addr, old as u32, new as u32, attr)
                    .map(u64::from)
                    .map_err(u64::from),
                PagingMode::Pae | PagingMode::LongMode => self.phys.cmpxchg_q(addr, old, new, attr),
            };
            if let Err(actual) = result {
                debug!("pmap: lost {level} update at {addr}: {old:#x} is now {actual:#x}");
                self.entry[level] = actual;
                return Err(PmapError::Raced);
            }
        } else {
            match self.mode {
                PagingMode::TwoLevel => self.phys.write_l(addr, new as u32, attr),
                PagingMode::Pae | PagingMode::LongMode => self.phys.write_q(addr, new, attr),
            }
        }
        self.entry[level] = new;
        Ok(())
    }
}

/// A cursor's walk, root first.
#[derive(Copy, Clone, Debug)]
pub struct PmapTrace {
    mode: PagingMode,
    virt: VirtualAddress,
    entry: LevelArray<u64, 5>,
    entryaddr: LevelArray<PhysicalAddress, 4>,
    reached: Level,
    requested: Level,
}

impl PmapTrace {
    /// `(level, entry address, entry)` of every loaded level, root table first.
    #[must_use]
    pub fn levels(&self) -> impl Iterator<Item = (Level, PhysicalAddress, u64)> + '_ {
        let mut next = Some(self.mode.top_level());
        core::iter::from_fn(move || {
            let level = next.filter(|l| *l >= self.reached)?;
            next = level.below();
            Some((level, self.entryaddr[level], self.entry[level]))
        })
    }

    #[must_use]
    pub const fn reached(&self) -> Level {
        self.reached
    }
}

impl fmt::Display for PmapTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pmap {:?} {}: root {:#x}",
            self.mode,
            self.virt,
            self.entry[self.mode.root_level()]
        )?;
        for (level, addr, value) in self.levels() {
            write!(f, ", {level} @{addr} = {value:#x}")?;
        }
        if self.reached > self.requested {
            write!(f, " (stopped at {}, wanted {})", self.reached, self.requested)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv_phys::SparseRam;

    const P_RW_US: u64 = 0b111;

    fn long_mode(ram: &SparseRam) -> (PhysicalAddress, Pmap<'_, SparseRam>) {
        let root = ram.alloc_4k().expect("root");
        let pmap = Pmap::open_vmm(PhysAccess::new(ram), root.as_u64(), 4).expect("depth");
        (root, pmap)
    }

    #[test]
    fn fresh_cursor_sits_at_the_root() {
        let ram = SparseRam::new();
        let (root, pmap) = long_mode(&ram);
        assert_eq!(pmap.read_level(), PagingMode::LongMode.root_level());
        assert_eq!(pmap.read(), root.as_u64());
        assert_eq!(pmap.entry_address(), None);
        assert!(Pmap::open_vmm(PhysAccess::new(&ram), 0, 5).is_err());
    }

    #[test]
    fn walk_stops_at_first_absent_level() {
        let ram = SparseRam::new();
        let (_, mut pmap) = long_mode(&ram);
        pmap.seek(VirtualAddress::new(0x4000_0000), Level::L1);
        assert_eq!(pmap.read_level(), Level::L4);
        assert_eq!(pmap.read(), 0);
        assert_eq!(pmap.write(0x1003, u64::MAX), Err(PmapError::NoParentTable));
        assert_eq!(pmap.clear(), Err(PmapError::NoParentTable));
    }

    #[test]
    fn autoalloc_installs_every_level() {
        let ram = SparseRam::new();
        let (_, mut pmap) = long_mode(&ram);
        let va = VirtualAddress::new(0x0000_0012_3456_7000);
        pmap.seek(va, Level::L1);
        pmap.autoalloc(&ram).expect("tables");
        assert_eq!(pmap.read_level(), Level::L1);
        assert_eq!(ram.live_frames(), 4);

        let trace = pmap.dump();
        let levels: Vec<_> = trace.levels().map(|(l, _, _)| l).collect();
        assert_eq!(levels, [Level::L4, Level::L3, Level::L2, Level::L1]);
        for (level, _, value) in trace.levels().take(3) {
            assert_eq!(value & 0xFFF, P_RW_US, "{level}");
        }
        // Idempotent once everything exists.
        pmap.autoalloc(&ram).expect("no-op");
        assert_eq!(ram.live_frames(), 4);
    }

    #[test]
    fn pae_pdpt_entries_get_only_the_present_bit() {
        let ram = SparseRam::new();
        let root = ram.alloc_4k().expect("root");
        let mut pmap = Pmap::open_vmm(PhysAccess::new(&ram), root.as_u64(), 3).expect("depth");
        pmap.seek(VirtualAddress::new(0x8000_1000), Level::L1);
        pmap.autoalloc(&ram).expect("tables");
        pmap.set_level(Level::L3);
        assert_eq!(pmap.read() & 0xFFF, 1);
        pmap.set_level(Level::L2);
        assert_eq!(pmap.read() & 0xFFF, P_RW_US);
    }

    #[test]
    fn write_takes_address_and_masked_flags_only() {
        let ram = SparseRam::new();
        let (_, mut pmap) = long_mode(&ram);
        let va = VirtualAddress::new(0x20_0000);
        pmap.seek(va, Level::L1);
        pmap.autoalloc(&ram).expect("tables");

        let nx = 1 << 63;
        pmap.write(0xAB_C000 | P_RW_US | nx, u64::MAX).expect("write");
        assert_eq!(pmap.read(), 0xAB_C000 | P_RW_US | nx);

        // Only RW is taken from the new value; P, US and NX survive, the
        // address is replaced.
        pmap.write(0xDE_F000, 0b010).expect("write");
        assert_eq!(pmap.read(), 0xDE_F000 | 0b101 | nx);

        // And the table in memory agrees with the cursor.
        let mut other = Pmap::open_vmm(PhysAccess::new(&ram), pmap.root(), 4).expect("depth");
        other.seek(va, Level::L1);
        assert_eq!(other.read(), pmap.read());
        assert_eq!(other.translate(), Some(PhysicalAddress::new(0xDE_F000)));
    }

    #[test]
    fn large_page_ends_the_walk() {
        let ram = SparseRam::new();
        let (_, mut pmap) = long_mode(&ram);
        let va = VirtualAddress::new(0x4020_0000);
        pmap.seek(va, Level::L2);
        pmap.autoalloc(&ram).expect("tables");
        pmap.write(0x8000_0000 | 0x80 | 0b11, u64::MAX).expect("2M leaf");

        pmap.seek(va + 0x1234, Level::L1);
        assert_eq!(pmap.read_level(), Level::L2);
        assert_eq!(pmap.translate(), Some(PhysicalAddress::new(0x8000_1234)));
        assert_eq!(pmap.autoalloc(&ram), Err(PmapError::LargePage));
    }

    #[test]
    fn seek_reloads_the_level_it_stopped_at() {
        let ram = SparseRam::new();
        let (_, mut pmap) = long_mode(&ram);
        let a = VirtualAddress::new(0x1000);
        let b = VirtualAddress::new(0x2000);
        for va in [a, b] {
            pmap.seek(va, Level::L1);
            pmap.autoalloc(&ram).expect("tables");
            pmap.write(0x9000 | 0b11, u64::MAX).expect("map");
        }

        // Drop the page table both pages live in.
        pmap.seek(a, Level::L2);
        pmap.clear().expect("clear");

        pmap.seek(b, Level::L1);
        assert_eq!(pmap.read_level(), Level::L2);
        assert_eq!(pmap.read(), 0);
    }

    #[test]
    fn set_level_moves_up_and_resumes_down() {
        let ram = SparseRam::new();
        let (_, mut pmap) = long_mode(&ram);
        let va = VirtualAddress::new(0x7000);
        pmap.seek(va, Level::L1);
        pmap.autoalloc(&ram).expect("tables");
        let pte_addr = pmap.entry_address();

        pmap.set_level(Level::L3);
        assert_eq!(pmap.read_level(), Level::L3);
        assert_eq!(pmap.read() & 1, 1);

        pmap.set_level(Level::L1);
        assert_eq!(pmap.read_level(), Level::L1);
        assert_eq!(pmap.entry_address(), pte_addr);
    }

    #[test]
    fn atomic_cursor_reports_lost_race_without_clobbering() {
        let ram = SparseRam::new();
        let root = ram.alloc_4k().expect("root");
        let phys = PhysAccess::new(&ram);
        let va = VirtualAddress::new(0x3000);

        let mut host = Pmap::open_guest(phys, root.as_u64(), 4, true).expect("depth");
        host.seek(va, Level::L1);
        host.autoalloc(&ram).expect("tables");
        host.write(0x5000 | 0b111, u64::MAX).expect("map");

        // The guest rewrites the entry behind the host's back.
        let slot = host.entry_address().expect("slot");
        phys.write_q(slot, 0x6000 | 0b101, PhysAttr::ATOMIC);

        assert_eq!(host.write(0, 0b010), Err(PmapError::Raced));
        assert_eq!(phys.read_q(slot, PhysAttr::ATOMIC), 0x6000 | 0b101);
        assert_eq!(host.read(), 0x6000 | 0b101);

        // Retrying against the fresh value succeeds.
        host.write(host.read(), 0).expect("retry");
        assert_eq!(host.clear(), Ok(()));
        assert_eq!(phys.read_q(slot, PhysAttr::ATOMIC), 0);
    }

    #[test]
    fn atomic_autoalloc_returns_the_table_on_a_lost_install() {
        // A store that flips the slot between the cursor's load and its CAS.
        struct Meddling<'a> {
            ram: &'a SparseRam,
            victim: PhysicalAddress,
        }
        impl PhysMemory for Meddling<'_> {
            fn read(&self, pa: PhysicalAddress, buf: &mut [u8], attr: PhysAttr) -> Result<(), hv_phys::PhysError> {
                self.ram.read(pa, buf, attr)
            }
            fn write(&self, pa: PhysicalAddress, buf: &[u8], attr: PhysAttr) -> Result<(), hv_phys::PhysError> {
                self.ram.write(pa, buf, attr)
            }
            fn compare_exchange_u32(&self, pa: PhysicalAddress, c: u32, n: u32, attr: PhysAttr) -> Result<u32, hv_phys::PhysError> {
                self.ram.compare_exchange_u32(pa, c, n, attr)
            }
            fn compare_exchange_u64(&self, pa: PhysicalAddress, c: u64, n: u64, attr: PhysAttr) -> Result<u64, hv_phys::PhysError> {
                if pa == self.victim {
                    self.ram.write(pa, &0x7777_7000_u64.to_le_bytes(), attr)?;
                }
                self.ram.compare_exchange_u64(pa, c, n, attr)
            }
        }

        let ram = SparseRam::new();
        let root = ram.alloc_4k().expect("root");
        let meddling = Meddling { ram: &ram, victim: root };
        let mut pmap =
            Pmap::open_guest(PhysAccess::new(&meddling), root.as_u64(), 4, true).expect("depth");
        pmap.seek(VirtualAddress::new(0), Level::L1);
        let before = ram.live_frames();
        assert_eq!(pmap.autoalloc(&ram), Err(PmapError::Raced));
        assert_eq!(ram.live_frames(), before);
        assert_eq!(pmap.read(), 0x7777_7000);
    }

    #[test]
    fn pointer_aliases_the_entry_slot() {
        let ram = SparseRam::new();
        let (_, mut pmap) = long_mode(&ram);
        pmap.seek(VirtualAddress::new(0x5000), Level::L1);
        pmap.autoalloc(&ram).expect("tables");
        pmap.write(0xCAFE_0000 | 0b11, u64::MAX).expect("map");

        let Some(EntryPtr::Entry64(p)) = pmap.pointer(&ram) else {
            panic!("64-bit slot expected");
        };
        // SAFETY: the frame stays backed for the whole test.
        assert_eq!(unsafe { p.as_ptr().read_unaligned() }, 0xCAFE_0003);

        pmap.seek(VirtualAddress::new(0x80_0000_0000), Level::L1);
        assert!(pmap.pointer(&ram).is_none());
    }

    #[test]
    fn dump_names_every_loaded_level() {
        let ram = SparseRam::new();
        let (_, mut pmap) = long_mode(&ram);
        pmap.seek(VirtualAddress::new(0x1000), Level::L1);
        let text = pmap.dump().to_string();
        assert!(text.starts_with("pmap LongMode 0x0000000000001000"), "{text}");
        assert!(text.contains("L4 @"), "{text}");
        assert!(text.ends_with("(stopped at L4, wanted L1)"), "{text}");
    }
}
