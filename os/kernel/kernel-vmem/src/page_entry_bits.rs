use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// A single 32-bit page directory or page table entry in raw bitfield form.
///
/// Both levels of 32-bit paging share this layout; the only difference is
/// that bit 7 means "4 MiB page" in a directory entry and PAT in a table
/// entry. The kernel never uses either, so it is always written as 0.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Present |
/// | 1     | `RW`            | Writable |
/// | 2     | `US`            | User-mode accessible |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Cache disable |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (table entries only) |
/// | 7     | `PS` / `PAT`    | Large page / page attribute |
/// | 8     | `G`             | Global (table entries only) |
/// | 9–11  | avail           | Free for OS use |
/// | 12–31 | frame           | Frame number of the table or page |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_memory_addresses::PhysicalPage;
/// let e = PageEntryBits::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_frame_page(PhysicalPage::from_frame_number(0x123));
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a table entry.
    pub dirty: bool,

    /// Page Size (PS) in directory entries, PAT in table entries (bit 7).
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Frame number (bits 12..=31).
    #[bits(20)]
    frame: u32,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn frame_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.frame())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame_page(self, page: PhysicalPage<Size4K>) -> Self {
        self.with_frame(page.frame_number())
    }

    /// Whether `other` grants the same permissions and caching behavior,
    /// ignoring the CPU-maintained accessed and dirty bits.
    #[inline]
    #[must_use]
    pub const fn same_access(&self, other: &Self) -> bool {
        self.writable() == other.writable()
            && self.user_access() == other.user_access()
            && self.write_through() == other.write_through()
            && self.cache_disabled() == other.cache_disabled()
    }
}

/// Permission bits requested for a mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageAccess {
    pub writable: bool,
    pub user: bool,
}

impl PageAccess {
    /// Supervisor read/write; kernel data, heap, stacks and page tables.
    pub const KERNEL_RW: Self = Self {
        writable: true,
        user: false,
    };

    /// Supervisor read-only; the kernel image.
    pub const KERNEL_RO: Self = Self {
        writable: false,
        user: false,
    };

    pub const USER_RW: Self = Self {
        writable: true,
        user: true,
    };

    /// Present entry bits carrying these permissions (no frame yet).
    #[inline]
    #[must_use]
    pub const fn entry_bits(self) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(self.writable)
            .with_user_access(self.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_field_covers_upper_bits() {
        let e = PageEntryBits::new().with_frame_page(PhysicalPage::from_frame_number(0xF_FFFF));
        assert_eq!(e.into_bits(), 0xFFFF_F000);
        assert_eq!(e.frame_page().base().as_u32(), 0xFFFF_F000);
    }

    #[test]
    fn access_bits() {
        let e = PageAccess::KERNEL_RO.entry_bits();
        assert!(e.present());
        assert!(!e.writable());
        assert!(!e.user_access());
        assert_eq!(PageAccess::USER_RW.entry_bits().into_bits(), 0b111);
    }

    #[test]
    fn same_access_ignores_cpu_bits() {
        let a = PageAccess::KERNEL_RW.entry_bits();
        let b = a.with_accessed(true).with_dirty(true);
        assert!(a.same_access(&b));
        assert!(!a.same_access(&PageAccess::KERNEL_RO.entry_bits()));
    }
}
