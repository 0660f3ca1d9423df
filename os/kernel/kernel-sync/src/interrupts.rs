//! Interrupt masking.
//!
//! [`InterruptControl`] abstracts the interrupt flag so that the scheduler and
//! the memory manager can be driven on a host. [`InterruptLock`] is the
//! re-entrant "scheduler lock": a disable counter that masks interrupts on the
//! first acquisition and restores the saved state when the last guard drops.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Access to the CPU's interrupt flag.
pub trait InterruptControl {
    /// Whether maskable interrupts are currently delivered.
    fn interrupts_enabled(&self) -> bool;

    /// Masks interrupts (`cli`).
    fn disable_interrupts(&self);

    /// Unmasks interrupts (`sti`).
    fn enable_interrupts(&self);
}

/// The interrupt flag of the executing x86 CPU.
///
/// # Privilege
/// `cli`/`sti` require ring 0.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Interrupts;

#[cfg(target_arch = "x86")]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        let flags: u32;
        unsafe {
            core::arch::asm!("pushfd; pop {}", out(reg) flags, options(nomem, preserves_flags));
        }
        flags & (1 << 9) != 0
    }

    #[inline]
    fn disable_interrupts(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
    }

    #[inline]
    fn enable_interrupts(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
    }
}

/// Re-entrant interrupt-disable counter.
///
/// The first [`acquire`](Self::acquire) snapshots the interrupt flag and masks
/// interrupts; nested acquisitions only bump the counter. Interrupts are
/// re-enabled when the counter returns to zero, and only if they were enabled
/// at the first acquisition.
#[derive(Debug, Default)]
pub struct InterruptLock {
    depth: AtomicU32,
    restore: AtomicBool,
}

impl InterruptLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            restore: AtomicBool::new(false),
        }
    }

    /// Masks interrupts and increments the counter.
    pub fn acquire<'a, I: InterruptControl + ?Sized>(&'a self, ctl: &'a I) -> InterruptGuard<'a, I> {
        let were_enabled = ctl.interrupts_enabled();
        ctl.disable_interrupts();
        if self.depth.fetch_add(1, Ordering::Acquire) == 0 {
            self.restore.store(were_enabled, Ordering::Relaxed);
        }
        InterruptGuard { lock: self, ctl }
    }

    /// Current nesting depth.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.depth() > 0
    }

    /// What the running flow of control holds; saved across a context switch.
    #[inline]
    pub fn held(&self) -> HeldState {
        HeldState {
            depth: self.depth.load(Ordering::Relaxed),
            restore: self.restore.load(Ordering::Relaxed),
        }
    }

    /// Reinstates the hold of a flow of control that is being resumed.
    ///
    /// # Safety
    /// Only at a context switch, with interrupts masked. `state` must be what
    /// the resumed flow held when it was switched out, or
    /// [`HeldState::RELEASED`] for one that starts fresh.
    #[inline]
    pub unsafe fn resume(&self, state: HeldState) {
        self.depth.store(state.depth, Ordering::Relaxed);
        self.restore.store(state.restore, Ordering::Relaxed);
    }
}

/// Snapshot of an [`InterruptLock`] hold, see [`InterruptLock::held`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeldState {
    depth: u32,
    restore: bool,
}

impl HeldState {
    /// Nothing held.
    pub const RELEASED: Self = Self {
        depth: 0,
        restore: false,
    };

    #[inline]
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }
}

/// Held acquisition of an [`InterruptLock`].
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct InterruptGuard<'a, I: InterruptControl + ?Sized> {
    lock: &'a InterruptLock,
    ctl: &'a I,
}

impl<I: InterruptControl + ?Sized> Drop for InterruptGuard<'_, I> {
    fn drop(&mut self) {
        let previous = self.lock.depth.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "interrupt lock underflow");
        if previous == 1 && self.lock.restore.load(Ordering::Relaxed) {
            self.ctl.enable_interrupts();
        }
    }
}
