use crate::{MmioError, MmioHandler};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use hv_memory_addresses::PhysicalAddress;
use hv_sync::SpinLock;
use log::{debug, trace};

/// Identifies one registered window for [`MmioBus::unregister`] and
/// [`MmioBus::relocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MmioHandle(u64);

struct Window {
    handle: MmioHandle,
    len: u64,
    handler: Arc<dyn MmioHandler>,
}

impl Window {
    const fn end(&self, base: u64) -> u64 {
        base + self.len
    }
}

struct Windows {
    /// Base → window. Windows never overlap.
    by_base: BTreeMap<u64, Window>,
    next: u64,
}

impl Windows {
    fn containing(&self, addr: u64) -> Option<&Window> {
        let (&base, w) = self.by_base.range(..=addr).next_back()?;
        (addr < w.end(base)).then_some(w)
    }

    fn base_of(&self, handle: MmioHandle) -> Option<u64> {
        self.by_base
            .iter()
            .find_map(|(&base, w)| (w.handle == handle).then_some(base))
    }

    /// Whether `[base, base + len)` is free, ignoring the window `skip`.
    fn is_free(&self, base: u64, len: u64, skip: Option<MmioHandle>) -> bool {
        // Only the highest window starting below `end` can reach into the range.
        self.by_base
            .range(..base + len)
            .rev()
            .find(|(_, w)| Some(w.handle) != skip)
            .is_none_or(|(&b, w)| w.end(b) <= base)
    }
}

/// Registry of trapped guest-physical windows.
pub struct MmioBus {
    windows: SpinLock<Windows>,
}

impl Default for MmioBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MmioBus {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            windows: SpinLock::new(Windows {
                by_base: BTreeMap::new(),
                next: 0,
            }),
        }
    }

    /// Trap `[base, base + len)` to `handler`.
    ///
    /// # Errors
    /// - [`MmioError::InvalidWindow`] for an empty or wrapping range.
    /// - [`MmioError::Overlap`] if it intersects a registered window.
    pub fn register(
        &self,
        base: PhysicalAddress,
        len: u64,
        handler: Arc<dyn MmioHandler>,
    ) -> Result<MmioHandle, MmioError> {
        check_range(base, len)?;
        let mut windows = self.windows.lock();
        if !windows.is_free(base.as_u64(), len, None) {
            return Err(MmioError::Overlap { base, len });
        }
        let handle = MmioHandle(windows.next);
        windows.next += 1;
        windows.by_base.insert(base.as_u64(), Window { handle, len, handler });
        debug!("mmio: {handle:?} at {base} +{len:#x}");
        Ok(handle)
    }

    /// Stop trapping the window. Accesses already being dispatched finish.
    ///
    /// # Errors
    /// [`MmioError::UnknownHandle`].
    pub fn unregister(&self, handle: MmioHandle) -> Result<(), MmioError> {
        let mut windows = self.windows.lock();
        let base = windows.base_of(handle).ok_or(MmioError::UnknownHandle(handle))?;
        windows.by_base.remove(&base);
        debug!("mmio: {handle:?} removed from {}", PhysicalAddress::new(base));
        Ok(())
    }

    /// Move the window to `new_base`, keeping its length and handler.
    ///
    /// The move happens under one lock hold, so every access sees the window
    /// either at the old base or at the new one.
    ///
    /// # Errors
    /// [`MmioError::UnknownHandle`], [`MmioError::InvalidWindow`] or
    /// [`MmioError::Overlap`]; the window stays where it was.
    pub fn relocate(&self, handle: MmioHandle, new_base: PhysicalAddress) -> Result<(), MmioError> {
        let mut windows = self.windows.lock();
        let old = windows.base_of(handle).ok_or(MmioError::UnknownHandle(handle))?;
        if old == new_base.as_u64() {
            return Ok(());
        }
        let len = windows.by_base[&old].len;
        check_range(new_base, len)?;
        if !windows.is_free(new_base.as_u64(), len, Some(handle)) {
            return Err(MmioError::Overlap { base: new_base, len });
        }
        if let Some(w) = windows.by_base.remove(&old) {
            windows.by_base.insert(new_base.as_u64(), w);
        }
        debug!(
            "mmio: {handle:?} moved {} -> {new_base}",
            PhysicalAddress::new(old)
        );
        Ok(())
    }

    /// Current base of a window.
    #[must_use]
    pub fn base(&self, handle: MmioHandle) -> Option<PhysicalAddress> {
        self.windows.lock().base_of(handle).map(PhysicalAddress::new)
    }

    /// Hand an access at `gphys` to the window containing it.
    ///
    /// Returns `false` if no window contains `gphys` or the handler declined.
    /// The handler is called with the bus unlocked.
    pub fn dispatch(&self, gphys: PhysicalAddress, write: bool, buf: &mut [u8], flags: u32) -> bool {
        let handler = {
            let windows = self.windows.lock();
            match windows.containing(gphys.as_u64()) {
                Some(w) => Arc::clone(&w.handler),
                None => {
                    trace!("mmio: no window at {gphys}");
                    return false;
                }
            }
        };
        handler.access(gphys, write, buf, flags)
    }
}

const fn check_range(base: PhysicalAddress, len: u64) -> Result<(), MmioError> {
    match base.as_u64().checked_add(len) {
        Some(_) if len > 0 => Ok(()),
        _ => Err(MmioError::InvalidWindow { base }),
    }
}
