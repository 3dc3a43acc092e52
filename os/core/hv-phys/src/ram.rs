//! In-memory sparse physical store.

#![allow(clippy::cast_possible_truncation)]

use crate::{FrameAlloc, PhysAttr, PhysError, PhysMapper, PhysMemory};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use hv_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use hv_sync::SpinLock;
use log::trace;

const FRAME_BYTES: usize = 4096;

/// First frame handed out by [`SparseRam::alloc_4k`]; below it tests are
/// free to place frames at fixed addresses with [`SparseRam::back`].
const ALLOC_BASE: u64 = 0x0100_0000;

struct Frame(UnsafeCell<[u8; FRAME_BYTES]>);

// Safety: contents are only touched with the store lock held, or through a
// `PhysMapper` pointer whose use the caller synchronizes.
unsafe impl Sync for Frame {}
unsafe impl Send for Frame {}

impl Frame {
    fn zeroed() -> Box<Self> {
        Box::new(Self(UnsafeCell::new([0; FRAME_BYTES])))
    }

    /// # Safety
    /// The store lock must be held.
    unsafe fn bytes(&self) -> &mut [u8; FRAME_BYTES] {
        unsafe { &mut *self.0.get() }
    }
}

struct Inner {
    /// Frame number → contents. Absent frames are unbacked.
    frames: BTreeMap<u64, Box<Frame>>,
    free: Vec<u64>,
    next: u64,
    limit: Option<usize>,
}

/// Sparse physical memory kept on the heap.
///
/// Frames come into existence through [`FrameAlloc::alloc_4k`] (zero-filled)
/// or [`SparseRam::back`], and become unbacked again on
/// [`FrameAlloc::free_4k`]. Accesses to anything else behave like a floating
/// bus. Compare-and-swap with [`PhysAttr::ATOMIC`] runs in a single lock
/// hold; without it the load and the store are separate, like a plain
/// read-modify-write would be.
pub struct SparseRam {
    inner: SpinLock<Inner>,
}

impl Default for SparseRam {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseRam {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                frames: BTreeMap::new(),
                free: Vec::new(),
                next: ALLOC_BASE / PAGE_SIZE,
                limit: None,
            }),
        }
    }

    /// A store whose allocator fails once `frames` frames are live.
    #[must_use]
    pub fn with_frame_limit(frames: usize) -> Self {
        let ram = Self::new();
        ram.inner.lock().limit = Some(frames);
        ram
    }

    /// Back the frame containing `pa` (zero-filled) if it isn't already.
    pub fn back(&self, pa: PhysicalAddress) {
        self.inner.with_lock(|inner| {
            inner
                .frames
                .entry(pa.as_u64() / PAGE_SIZE)
                .or_insert_with(Frame::zeroed);
        });
    }

    /// Number of frames currently backed.
    #[must_use]
    pub fn live_frames(&self) -> usize {
        self.inner.lock().frames.len()
    }

    #[must_use]
    pub fn is_backed(&self, pa: PhysicalAddress) -> bool {
        self.inner.lock().frames.contains_key(&(pa.as_u64() / PAGE_SIZE))
    }

    /// Walk `[pa, pa + len)` frame by frame, handing each piece to `f` with
    /// its offset in the caller's buffer. Fails before calling `f` if any
    /// frame in the range is unbacked.
    fn for_each_chunk(
        inner: &Inner,
        pa: PhysicalAddress,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), PhysError> {
        if len == 0 {
            return Ok(());
        }
        let start = pa.as_u64();
        // A range past the top of the address space has nothing behind it.
        let last = start.checked_add(len as u64 - 1).ok_or(PhysError::Unbacked(pa))?;
        for frame in start / PAGE_SIZE..=last / PAGE_SIZE {
            if !inner.frames.contains_key(&frame) {
                return Err(PhysError::Unbacked(PhysicalAddress::new(start.max(frame * PAGE_SIZE))));
            }
        }

        let mut done = 0;
        while done < len {
            let at = start + done as u64;
            let frame = &inner.frames[&(at / PAGE_SIZE)];
            let off = (at % PAGE_SIZE) as usize;
            let n = (FRAME_BYTES - off).min(len - done);
            // SAFETY: caller holds the lock.
            let bytes = unsafe { frame.bytes() };
            f(&mut bytes[off..off + n], done);
            done += n;
        }
        Ok(())
    }

    fn cmpxchg<const N: usize>(
        &self,
        pa: PhysicalAddress,
        current: [u8; N],
        new: [u8; N],
        attr: PhysAttr,
    ) -> Result<[u8; N], PhysError> {
        let mut seen = [0; N];
        if attr.contains(PhysAttr::ATOMIC) {
            let inner = self.inner.lock();
            Self::for_each_chunk(&inner, pa, N, |b, o| seen[o..o + b.len()].copy_from_slice(b))?;
            if seen == current {
                Self::for_each_chunk(&inner, pa, N, |b, o| b.copy_from_slice(&new[o..o + b.len()]))?;
            }
        } else {
            self.read(pa, &mut seen, attr)?;
            if seen == current {
                self.write(pa, &new, attr)?;
            }
        }
        Ok(seen)
    }
}

impl PhysMemory for SparseRam {
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8], _attr: PhysAttr) -> Result<(), PhysError> {
        let inner = self.inner.lock();
        Self::for_each_chunk(&inner, pa, buf.len(), |b, o| {
            buf[o..o + b.len()].copy_from_slice(b);
        })
    }

    fn write(&self, pa: PhysicalAddress, buf: &[u8], _attr: PhysAttr) -> Result<(), PhysError> {
        let inner = self.inner.lock();
        Self::for_each_chunk(&inner, pa, buf.len(), |b, o| {
            b.copy_from_slice(&buf[o..o + b.len()]);
        })
    }

    fn compare_exchange_u32(
        &self,
        pa: PhysicalAddress,
        current: u32,
        new: u32,
        attr: PhysAttr,
    ) -> Result<u32, PhysError> {
        self.cmpxchg(pa, current.to_le_bytes(), new.to_le_bytes(), attr)
            .map(u32::from_le_bytes)
    }

    fn compare_exchange_u64(
        &self,
        pa: PhysicalAddress,
        current: u64,
        new: u64,
        attr: PhysAttr,
    ) -> Result<u64, PhysError> {
        self.cmpxchg(pa, current.to_le_bytes(), new.to_le_bytes(), attr)
            .map(u64::from_le_bytes)
    }
}

impl FrameAlloc for SparseRam {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        let mut inner = self.inner.lock();
        if inner.limit.is_some_and(|limit| inner.frames.len() >= limit) {
            trace!("ram: frame limit reached");
            return None;
        }
        let frame = match inner.free.pop() {
            Some(frame) => frame,
            None => loop {
                let frame = inner.next;
                inner.next += 1;
                if !inner.frames.contains_key(&frame) {
                    break frame;
                }
            },
        };
        inner.frames.insert(frame, Frame::zeroed());
        Some(PhysicalAddress::new(frame * PAGE_SIZE))
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        let frame = pa.as_u64() / PAGE_SIZE;
        let mut inner = self.inner.lock();
        if inner.frames.remove(&frame).is_some() {
            inner.free.push(frame);
        } else {
            trace!("ram: free of unbacked frame {pa}");
        }
    }
}

impl PhysMapper for SparseRam {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        let inner = self.inner.lock();
        let frame = inner.frames.get(&(pa.as_u64() / PAGE_SIZE))?;
        let base = frame.0.get().cast::<u8>();
        // Boxed frames never move while they are backed.
        NonNull::new(base.wrapping_add((pa.as_u64() % PAGE_SIZE) as usize))
    }
}
