//! # Debug Console Output
//!
//! Diagnostic sink for the kernel: a `log::Log` backend that writes formatted
//! records byte by byte to the Bochs/QEMU debug console port `0xE9`.
//!
//! ## Host-Side Configuration
//! ```bash
//! qemu-system-i386 -kernel kernel.elf -debugcon stdio
//! ```
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new();
//! LOGGER.init(LevelFilter::Debug).expect("logger installed once");
//! log::info!("paging enabled");
//! ```
//!
//! With the `enabled` feature off, or anywhere but the bare-metal IA-32
//! target, every write is a no-op and the logger only filters.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, write_record};

#[doc(hidden)]
pub mod debugcon {
    use core::fmt::{self, Write};

    /// The Bochs/QEMU debug console port.
    pub const DEBUGCON_PORT: u16 = 0xE9;

    /// Write a single byte to the debug console.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn putc(byte: u8) {
        #[cfg(all(feature = "enabled", target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") DEBUGCON_PORT,
                in("al") byte,
                options(nomem, nostack, preserves_flags)
            );
        }

        #[cfg(not(all(feature = "enabled", target_arch = "x86", target_os = "none")))]
        let _ = byte;
    }

    /// `fmt::Write` adapter over [`putc`].
    pub struct DebugconSink;

    impl Write for DebugconSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(putc);
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn write(args: fmt::Arguments) {
        // Best-effort output; there is nobody to report a failure to.
        let _ = fmt::write(&mut DebugconSink, args);
    }
}

/// Prints directly to the debug console, bypassing the `log` facade.
///
/// Used for output that must appear even if no logger is installed, such as
/// the final line of a panic.
#[macro_export]
macro_rules! debugcon {
    ($($arg:tt)*) => {{
        $crate::debugcon::write(core::format_args!($($arg)*));
    }};
}
