use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Bare test-and-test-and-set flag with explicit acquire/release.
///
/// Used directly where a critical section does not own data of its own;
/// [`SpinLock`](crate::SpinLock) wraps it for the data-owning case.
pub struct RawSpin {
    held: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Spins until the flag is taken.
    #[inline]
    pub fn acquire(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// Releases the flag.
    ///
    /// # Safety
    /// The caller must be the one that acquired it.
    #[inline]
    pub unsafe fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}
