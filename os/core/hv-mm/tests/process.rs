//! Address-space manager against `SparseRam` and a recording processor.

use hv_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use hv_mm::{MmError, ProcessLayout, ProcessMm, ProcessRoot, Processor};
use hv_phys::{FrameAlloc, PhysAccess, PhysAttr, SparseRam};
use hv_pmap::{Level, PageEntryBits, PagingMode, Pmap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
struct FakeCpu {
    root: AtomicU64,
    masked: AtomicBool,
    invalidated: Mutex<Vec<u64>>,
    flushes: AtomicU64,
}

impl Processor for FakeCpu {
    fn root(&self) -> u64 {
        self.root.load(Ordering::SeqCst)
    }

    fn set_root(&self, root: u64) {
        assert!(self.masked.load(Ordering::SeqCst), "root loaded with interrupts enabled");
        self.root.store(root, Ordering::SeqCst);
    }

    fn invalidate(&self, va: VirtualAddress) {
        self.invalidated.lock().unwrap().push(va.as_u64());
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        let was = self.masked.swap(true, Ordering::SeqCst);
        let r = f();
        self.masked.store(was, Ordering::SeqCst);
        r
    }
}

const LM: PagingMode = PagingMode::LongMode;

/// Hypervisor root with one table installed in its upper half.
fn template(ram: &SparseRam) -> u64 {
    let root = ram.alloc_4k().unwrap();
    let table = ram.alloc_4k().unwrap();
    let index = ProcessLayout::for_mode(LM).user_end().as_u64() >> 39;
    let entry = table.as_u64() | 0b11;
    PhysAccess::new(ram).write_q(root + index * 8, entry, PhysAttr::WRITEBACK);
    root.as_u64()
}

fn manager(ram: &SparseRam) -> ProcessMm<'_, SparseRam, SparseRam, FakeCpu> {
    let root = template(ram);
    let cpu = FakeCpu::default();
    cpu.root.store(root, Ordering::SeqCst);
    ProcessMm::new(PhysAccess::new(ram), ram, cpu, ProcessLayout::for_mode(LM), root)
}

/// Allocate a process root and make it active.
fn enter(mm: &ProcessMm<'_, SparseRam, SparseRam, FakeCpu>) -> ProcessRoot {
    let root = mm.alloc().unwrap();
    mm.switch(root);
    root
}

fn leaf(ram: &SparseRam, root: ProcessRoot, va: u64) -> Option<PageEntryBits> {
    let mut pmap = Pmap::open_vmm(PhysAccess::new(ram), root.as_u64(), 4).unwrap();
    pmap.seek(VirtualAddress::new(va), Level::L1);
    let e = PageEntryBits::from_bits(pmap.read());
    (pmap.read_level() == Level::L1 && e.present()).then_some(e)
}

#[test]
fn new_roots_share_the_hypervisor_half_only() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let hv = PhysicalAddress::new(mm.cpu().root());
    let root = mm.alloc().unwrap();

    let phys = PhysAccess::new(&ram);
    let first_vmm = mm.layout().user_end().as_u64() >> 39;
    for i in 0..512 {
        let ours = phys.read_q(root.phys() + i * 8, PhysAttr::WRITEBACK);
        let theirs = phys.read_q(hv + i * 8, PhysAttr::WRITEBACK);
        if i < first_vmm {
            assert_eq!(ours, 0, "user entry {i}");
        } else {
            assert_eq!(ours, theirs, "hypervisor entry {i}");
        }
    }
    assert_ne!(phys.read_q(root.phys() + first_vmm * 8, PhysAttr::WRITEBACK), 0);
}

#[test]
fn map_alloc_backs_zeroed_writable_pages() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let root = enter(&mm);

    mm.map_alloc(VirtualAddress::new(0x40_0800), 0x1000).unwrap();
    for va in [0x40_0000, 0x40_1000] {
        let e = leaf(&ram, root, va).unwrap();
        assert!(e.writable() && e.user() && !e.shared());
        let mut buf = [0xAA; 64];
        PhysAccess::new(&ram).read_bytes(e.physical_address(), &mut buf, PhysAttr::WRITEBACK);
        assert_eq!(buf, [0; 64]);
    }
    assert!(leaf(&ram, root, 0x40_2000).is_none());
}

#[test]
fn overlapping_map_alloc_changes_nothing() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let root = enter(&mm);

    mm.map_alloc(VirtualAddress::new(0x40_2000), PAGE_SIZE).unwrap();
    let frames = ram.live_frames();
    assert_eq!(
        mm.map_alloc(VirtualAddress::new(0x40_0000), 4 * PAGE_SIZE),
        Err(MmError::Overlap(VirtualAddress::new(0x40_2000)))
    );
    assert_eq!(ram.live_frames(), frames);
    assert!(leaf(&ram, root, 0x40_0000).is_none());
}

#[test]
fn map_alloc_rejects_ranges_outside_user_space() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    enter(&mm);

    let end = mm.layout().user_end();
    assert_eq!(mm.map_alloc(VirtualAddress::zero(), PAGE_SIZE), Err(MmError::OutOfUserRange(VirtualAddress::zero())));
    assert_eq!(
        mm.map_alloc(VirtualAddress::new(end.as_u64() - PAGE_SIZE), 2 * PAGE_SIZE),
        Err(MmError::OutOfUserRange(VirtualAddress::new(end.as_u64() - PAGE_SIZE)))
    );
}

#[test]
fn map_alloc_rolls_back_when_memory_runs_out() {
    // template root + template table + process root + three tables + two pages
    let ram = SparseRam::with_frame_limit(8);
    let mm = manager(&ram);
    let root = enter(&mm);

    assert_eq!(mm.map_alloc(VirtualAddress::new(0x40_0000), 3 * PAGE_SIZE), Err(MmError::OutOfMemory));
    for va in [0x40_0000, 0x40_1000, 0x40_2000] {
        assert!(leaf(&ram, root, va).is_none());
    }
    // The tables stay, the two pages went back.
    assert_eq!(ram.live_frames(), 6);
    assert!(!mm.cpu().invalidated.lock().unwrap().is_empty());
}

#[test]
fn unmap_frees_owned_pages_but_not_shared_ones() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let root = enter(&mm);

    let foreign = ram.alloc_4k().unwrap();
    mm.map_alloc(VirtualAddress::new(0x40_0000), PAGE_SIZE).unwrap();
    mm.map_shared_physpage(VirtualAddress::new(0x40_1000), foreign, true).unwrap();
    let owned = leaf(&ram, root, 0x40_0000).unwrap().physical_address();
    assert!(leaf(&ram, root, 0x40_1000).unwrap().shared());

    mm.unmap(VirtualAddress::new(0x40_0000), 2 * PAGE_SIZE).unwrap();
    assert!(!ram.is_backed(owned));
    assert!(ram.is_backed(foreign));
    assert!(leaf(&ram, root, 0x40_0000).is_none());
    assert!(leaf(&ram, root, 0x40_1000).is_none());
    assert_eq!(*mm.cpu().invalidated.lock().unwrap(), vec![0x40_0000, 0x40_1000]);

    // Unmapping again is harmless.
    mm.unmap(VirtualAddress::new(0x40_0000), 2 * PAGE_SIZE).unwrap();
}

/// Processor owned by the test, so other fakes can watch it.
struct Borrowed<'a>(&'a FakeCpu);

impl Processor for Borrowed<'_> {
    fn root(&self) -> u64 {
        self.0.root()
    }

    fn set_root(&self, root: u64) {
        self.0.set_root(root);
    }

    fn invalidate(&self, va: VirtualAddress) {
        self.0.invalidate(va);
    }

    fn flush(&self) {
        self.0.flush();
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        self.0.without_interrupts(f)
    }
}

/// Allocator that insists a page is unmapped and its translation dropped
/// before the frame comes back.
struct Strict<'a> {
    ram: &'a SparseRam,
    cpu: &'a FakeCpu,
    pages: Mutex<Vec<(u64, PhysicalAddress)>>,
    freed: AtomicU64,
}

impl FrameAlloc for Strict<'_> {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        self.ram.alloc_4k()
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        let pages = self.pages.lock().unwrap();
        if let Some(&(va, _)) = pages.iter().find(|(_, frame)| *frame == pa) {
            let root = ProcessRoot::new(PhysicalAddress::new(self.cpu.root()));
            assert!(leaf(self.ram, root, va).is_none(), "{va:#x} still mapped");
            assert!(self.cpu.invalidated.lock().unwrap().contains(&va), "{va:#x} still cached");
            self.freed.fetch_add(1, Ordering::SeqCst);
        }
        self.ram.free_4k(pa);
    }
}

#[test]
fn frames_are_freed_only_after_their_translation_is_gone() {
    let ram = SparseRam::new();
    let root = template(&ram);
    let cpu = FakeCpu::default();
    cpu.root.store(root, Ordering::SeqCst);
    let strict = Strict { ram: &ram, cpu: &cpu, pages: Mutex::default(), freed: AtomicU64::new(0) };
    let mm = ProcessMm::new(PhysAccess::new(&ram), &strict, Borrowed(&cpu), ProcessLayout::for_mode(LM), root);

    let space = mm.alloc().unwrap();
    mm.switch(space);
    mm.map_alloc(VirtualAddress::new(0x40_0000), 3 * PAGE_SIZE).unwrap();
    strict.pages.lock().unwrap().extend(
        (0..3).map(|i| 0x40_0000 + i * PAGE_SIZE).map(|va| (va, leaf(&ram, space, va).unwrap().physical_address())),
    );

    mm.unmap(VirtualAddress::new(0x40_0000), 3 * PAGE_SIZE).unwrap();
    assert_eq!(strict.freed.load(Ordering::SeqCst), 3);
}

#[test]
fn map_shared_physpage_refuses_to_overlap() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    enter(&mm);

    mm.map_alloc(VirtualAddress::new(0x40_0000), PAGE_SIZE).unwrap();
    assert_eq!(
        mm.map_shared_physpage(VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x5000), false),
        Err(MmError::Overlap(VirtualAddress::new(0x40_0000)))
    );
}

#[test]
fn free_returns_every_frame() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let hv = PhysicalAddress::new(mm.cpu().root());
    let before = ram.live_frames();
    let foreign = ram.alloc_4k().unwrap();

    let root = enter(&mm);
    mm.map_alloc(VirtualAddress::new(0x40_0000), 3 * PAGE_SIZE).unwrap();
    mm.map_alloc(VirtualAddress::new(0x10_0000_0000), PAGE_SIZE).unwrap();
    mm.map_shared_physpage(VirtualAddress::new(0x80_0000), foreign, false).unwrap();
    mm.map_stack(2 * PAGE_SIZE).unwrap();

    assert_eq!(mm.switch(ProcessRoot::new(hv)), root);
    mm.free(root);
    assert_eq!(ram.live_frames(), before + 1);
    assert!(ram.is_backed(foreign));
}

#[test]
fn unmapall_empties_the_user_half_and_flushes() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let root = enter(&mm);
    let with_root = ram.live_frames();

    mm.map_alloc(VirtualAddress::new(0x40_0000), PAGE_SIZE).unwrap();
    mm.unmapall();
    assert_eq!(ram.live_frames(), with_root);
    assert!(leaf(&ram, root, 0x40_0000).is_none());
    assert_eq!(mm.cpu().flushes.load(Ordering::SeqCst), 1);

    // The space is still usable.
    mm.map_alloc(VirtualAddress::new(0x40_0000), PAGE_SIZE).unwrap();
}

#[test]
fn stacks_keep_a_guard_page_below() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let root = enter(&mm);
    let ceiling = mm.layout().stack_top().as_u64();

    let top = mm.map_stack(0x1800).unwrap().as_u64();
    assert_eq!(top, ceiling);
    assert!(leaf(&ram, root, top - 0x1000).is_some());
    assert!(leaf(&ram, root, top - 0x2000).is_some());
    assert!(leaf(&ram, root, top - 0x3000).is_none());

    // The next stack leaves the first one's guard alone.
    let second = mm.map_stack(PAGE_SIZE).unwrap().as_u64();
    assert_eq!(second, top - 0x3000);
    assert!(leaf(&ram, root, second - 0x1000).is_some());
    assert!(leaf(&ram, root, top - 0x3000).is_none());

    mm.unmapstack(VirtualAddress::new(top), 0x1800).unwrap();
    assert!(leaf(&ram, root, top - 0x1000).is_none());
    assert!(leaf(&ram, root, second - 0x1000).is_some());
}

#[test]
fn map_shared_aliases_the_other_space() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let phys = PhysAccess::new(&ram);

    let a = enter(&mm);
    mm.map_alloc(VirtualAddress::new(0x40_0000), 2 * PAGE_SIZE).unwrap();
    let page = leaf(&ram, a, 0x40_1000).unwrap().physical_address();
    phys.write_bytes(page + 0x10, b"hello", PhysAttr::WRITEBACK);

    let b = enter(&mm);
    let window = mm.map_shared(a, VirtualAddress::new(0x40_0ff0), 0x30, true).unwrap();
    let layout = *mm.layout();
    assert!(window >= layout.shared_start() && window < layout.user_end());
    assert_eq!(window.as_u64() & 0xFFF, 0xFF0);

    let there = leaf(&ram, b, window.as_u64() + 0x20).unwrap();
    assert!(there.shared() && there.writable());
    assert_eq!(there.physical_address(), page);
    let mut buf = [0; 5];
    phys.read_bytes(there.physical_address() + 0x10, &mut buf, PhysAttr::WRITEBACK);
    assert_eq!(&buf, b"hello");

    // Dropping the window leaves the owner's memory alone.
    mm.unmap(window, 0x30).unwrap();
    assert!(ram.is_backed(page));
    assert!(leaf(&ram, a, 0x40_1000).is_some());
}

#[test]
fn map_shared_checks_the_source() {
    let ram = SparseRam::new();
    let mm = manager(&ram);

    let a = enter(&mm);
    let ro = ram.alloc_4k().unwrap();
    mm.map_shared_physpage(VirtualAddress::new(0x40_0000), ro, false).unwrap();

    enter(&mm);
    assert_eq!(
        mm.map_shared(a, VirtualAddress::new(0x40_0000), PAGE_SIZE, true),
        Err(MmError::ReadOnly(VirtualAddress::new(0x40_0000)))
    );
    assert_eq!(
        mm.map_shared(a, VirtualAddress::new(0x40_0000), 2 * PAGE_SIZE, false),
        Err(MmError::NotMapped(VirtualAddress::new(0x40_1000)))
    );
    assert!(mm.map_shared(a, VirtualAddress::new(0x40_0000), PAGE_SIZE, false).is_ok());

    let top = VirtualAddress::new(u64::MAX - 0x10);
    assert_eq!(mm.map_shared(a, top, 0x100, false), Err(MmError::NotMapped(top)));
    assert_eq!(mm.map_alloc(top, 0x8), Err(MmError::OutOfUserRange(top)));
}

#[test]
fn switch_masks_interrupts_and_returns_the_old_root() {
    let ram = SparseRam::new();
    let mm = manager(&ram);
    let hv = mm.cpu().root();

    let a = mm.alloc().unwrap();
    assert_eq!(mm.switch(a).as_u64(), hv);
    assert_eq!(mm.cpu().root(), a.as_u64());
    assert!(!mm.cpu().masked.load(Ordering::SeqCst));
    assert_eq!(mm.switch(ProcessRoot::new(PhysicalAddress::new(hv))), a);
}

#[test]
fn two_level_spaces_work_too() {
    let ram = SparseRam::new();
    let root = ram.alloc_4k().unwrap().as_u64();
    let cpu = FakeCpu::default();
    cpu.root.store(root, Ordering::SeqCst);
    let layout = ProcessLayout::for_mode(PagingMode::TwoLevel);
    let mm = ProcessMm::new(PhysAccess::new(&ram), &ram, cpu, layout, root);

    let p = enter(&mm);
    mm.map_alloc(VirtualAddress::new(0x40_0000), PAGE_SIZE).unwrap();
    let mut pmap = Pmap::open_vmm(PhysAccess::new(&ram), p.as_u64(), 2).unwrap();
    pmap.seek(VirtualAddress::new(0x40_0000), Level::L1);
    assert!(pmap.translate().is_some());
    pmap.close();

    let before = ram.live_frames();
    mm.switch(ProcessRoot::new(PhysicalAddress::new(root)));
    mm.free(p);
    // root, one page table, one page
    assert_eq!(ram.live_frames(), before - 3);
}
