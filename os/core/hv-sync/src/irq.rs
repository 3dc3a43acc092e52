//! Interrupt masking on the current processor.
//!
//! Root-table switches must not be interleaved with an interrupt handler that
//! could observe (or reload) the stale root, so they run under an [`IrqGuard`].
//!
//! These operations execute `cli`/`sti`/`pushf` and are only legal at CPL0
//! (the hypervisor's own context).

/// `RFLAGS.IF`.
const RFLAGS_IF: u64 = 1 << 9;

#[inline]
fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

#[inline]
fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushf/pop`).
#[inline]
#[must_use]
#[cfg(target_arch = "x86_64")]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags)) }
    r
}

/// Returns the current `EFLAGS` value (via `pushf/pop`).
#[inline]
#[must_use]
#[cfg(target_arch = "x86")]
pub fn rflags() -> u64 {
    let r: u32;
    unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(preserves_flags)) }
    u64::from(r)
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Nested guards are fine: only the outermost one that actually observed
/// `IF=1` re-enables interrupts.
///
/// ```no_run
/// use hv_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new(); // interrupts off here
///     // swap the root table
/// }
/// // IF restored to its prior state
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = (rflags() & RFLAGS_IF) != 0;
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
