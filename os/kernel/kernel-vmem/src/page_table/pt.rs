//! # Page Table
//!
//! - [`TableIndex`]: index type for VA bits `[21:12]`.
//! - [`PtEntry`]: a leaf entry mapping one 4 KiB page.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 entries.

use crate::PageEntryBits;
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Index into a page table (VA bits `[21:12]`), `0..1024`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

/// A single page table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

/// A page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES_PER_TABLE],
}

impl TableIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 12) & 0x3FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl PtEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, the mapped frame and the entry's flags.
    #[inline]
    #[must_use]
    pub const fn page(self) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        if self.is_present() {
            Some((self.0.frame_page(), self.0))
        } else {
            None
        }
    }

    /// Create a 4 KiB leaf entry. Sets `present=1` and clears PAT.
    #[inline]
    #[must_use]
    pub const fn make_4k(page: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(false)
                .with_frame_page(page),
        )
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> TableIndex {
        TableIndex::from(va)
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageAccess;

    #[test]
    fn leaf_entry() {
        let frame = PhysicalPage::from_frame_number(0x5555);
        let e = PtEntry::make_4k(frame, PageAccess::KERNEL_RO.entry_bits());
        let (p, fl) = e.page().unwrap();
        assert_eq!(p.base().as_u32(), 0x0555_5000);
        assert!(!fl.writable());
        assert!(!fl.large_page());
    }

    #[test]
    fn table_index_masks_directory_bits() {
        assert_eq!(TableIndex::from(VirtualAddress::new(0xFFC0_1000)).as_usize(), 1);
    }

    #[test]
    fn empty_table() {
        let mut t = PageTable::zeroed();
        assert!(t.is_empty());
        t.set(TableIndex::new(9), PtEntry::make_4k(PhysicalPage::from_frame_number(1), PageEntryBits::new()));
        assert!(!t.is_empty());
    }
}
