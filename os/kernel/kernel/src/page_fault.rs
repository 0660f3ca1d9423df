//! # Page Fault Reporting
//!
//! Every page fault is fatal. The handler decodes what the CPU reported,
//! logs it and panics; the panic handler then halts the machine.

use crate::interrupts::InterruptContext;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{DirectoryIndex, TableIndex};

/// Page-fault error code layout (IA-32).
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read, 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor, 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch.
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            "Instruction fetch from a protected page"
        } else if self.write() {
            "Write access to a protected page"
        } else {
            "Read access to a protected page"
        }
    }
}

/// Everything known about one page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFaultReport {
    /// The linear address that faulted (CR2).
    pub address: VirtualAddress,
    pub error: PageFaultError,
    pub instruction_pointer: VirtualAddress,
}

impl PageFaultReport {
    #[must_use]
    pub const fn new(ctx: &InterruptContext, address: VirtualAddress) -> Self {
        Self {
            address,
            error: PageFaultError::from_bits(ctx.error_code),
            instruction_pointer: ctx.instruction_pointer,
        }
    }

    #[must_use]
    pub const fn directory_index(&self) -> DirectoryIndex {
        DirectoryIndex::from(self.address)
    }

    #[must_use]
    pub const fn table_index(&self) -> TableIndex {
        TableIndex::from(self.address)
    }
}

impl fmt::Display for PageFaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.error;
        write!(
            f,
            "page fault at {} (pde {}, pte {}) from eip {}: {}; {} {}{}{}",
            self.address,
            self.directory_index().as_usize(),
            self.table_index().as_usize(),
            self.instruction_pointer,
            e.explain(),
            if e.user() { "user" } else { "supervisor" },
            if e.write() { "write" } else { "read" },
            if e.present() { ", present" } else { "" },
            if e.instruction_fetch() { ", fetch" } else { "" },
        )
    }
}

/// Reports the fault and stops.
///
/// # Panics
/// Always.
pub fn handle(ctx: &InterruptContext, address: VirtualAddress) -> ! {
    let report = PageFaultReport::new(ctx, address);
    log::error!("{report}");
    log::error!("raw error code {:#x}", report.error.into_bits());
    panic!("unrecoverable page fault at {address}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(error_code: u32) -> InterruptContext {
        InterruptContext {
            vector: 14,
            error_code,
            instruction_pointer: VirtualAddress::new(0x0010_0ABC),
        }
    }

    #[test]
    fn indices_split_the_address() {
        let report = PageFaultReport::new(&ctx(0), VirtualAddress::new(0xBFFF_F123));
        assert_eq!(report.directory_index().as_usize(), 767);
        assert_eq!(report.table_index().as_usize(), 1023);
    }

    #[test]
    fn error_bits() {
        let e = PageFaultError::from_bits(0b0_0111);
        assert!(e.present() && e.write() && e.user());
        assert!(!e.reserved_bit() && !e.instruction_fetch());
        assert_eq!(e.explain(), "Write access to a protected page");
        assert_eq!(PageFaultError::from_bits(0).explain(), "Non-present page");
        assert_eq!(
            PageFaultError::from_bits(0b1001).explain(),
            "Reserved bit set in a paging structure"
        );
    }

    #[test]
    fn report_line() {
        let report = PageFaultReport::new(&ctx(0b10), VirtualAddress::new(0x0040_1000));
        assert_eq!(
            report.to_string(),
            "page fault at 0x00401000 (pde 1, pte 1) from eip 0x00100ABC: \
             Non-present page; supervisor write"
        );
    }

    #[test]
    #[should_panic(expected = "unrecoverable page fault at 0xDEADB000")]
    fn faults_are_fatal() {
        handle(&ctx(0), VirtualAddress::new(0xDEAD_B000));
    }
}
