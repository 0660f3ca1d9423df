//! # Two-Level Page Tables
//!
//! ```text
//! | 31‒22     | 21‒12   | 11‒0   |
//! | directory | table   | offset |
//! ```
//!
//! The directory (one per address space, loaded into CR3) holds 1024 entries,
//! each pointing to a page table of 1024 entries that map 4 KiB frames.

pub mod pd;
pub mod pt;

use crate::page_table::pd::DirectoryIndex;
use crate::page_table::pt::TableIndex;
use kernel_memory_addresses::VirtualAddress;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}

/// The virtual address selected by a directory and table index pair.
#[inline]
#[must_use]
pub const fn join_indices(dir: DirectoryIndex, table: TableIndex) -> VirtualAddress {
    VirtualAddress::new(dir.base().as_u32() | ((table.as_usize() as u32) << 12))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let va = VirtualAddress::new(0xBFC0_3123);
        let (dir, table) = split_indices(va);
        assert_eq!(dir.as_usize(), 767);
        assert_eq!(table.as_usize(), 3);
        assert_eq!(join_indices(dir, table), VirtualAddress::new(0xBFC0_3000));
    }

    #[test]
    fn last_page_of_the_address_space() {
        let (dir, table) = split_indices(VirtualAddress::new(0xFFFF_FFFF));
        assert_eq!((dir.as_usize(), table.as_usize()), (1023, 1023));
    }
}
