//! # x86 I/O Port Access
//!
//! The legacy devices the kernel still talks to directly:
//!
//! ```text
//! 0x0020-0x0021   Programmable Interrupt Controller (PIC) #1
//! 0x00A0-0x00A1   PIC #2
//! ```

/// Command port of the primary PIC.
pub const PIC1_COMMAND: u16 = 0x20;

/// Command port of the secondary PIC.
pub const PIC2_COMMAND: u16 = 0xA0;

/// Non-specific end-of-interrupt command.
pub const PIC_EOI: u8 = 0x20;

/// Write one byte to an I/O port. Uses `out dx, al`.
///
/// # Safety
/// - **Privilege:** execute at CPL0 or with I/O permission for `port`;
///   otherwise the CPU raises `#GP`.
/// - **Correct port:** `port` must belong to the intended device and the
///   device must be in a state that accepts `val`.
/// - **Ordering:** `out` is ordered against other I/O instructions but is not
///   a memory fence.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
}
