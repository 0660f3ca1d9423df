//! # Kernel synchronization primitives
//!
//! Single-core kernel locking: a data-owning [`SpinLock`], the re-entrant
//! interrupt-disable counter [`InterruptLock`] and the deferred-switch counter
//! [`SwitchPostponer`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod interrupts;
mod postpone;
mod raw_spin;
mod spin_lock;

pub use interrupts::{HeldState, InterruptControl, InterruptGuard, InterruptLock};
#[cfg(target_arch = "x86")]
pub use interrupts::X86Interrupts;
pub use postpone::SwitchPostponer;
pub use raw_spin::RawSpin;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
