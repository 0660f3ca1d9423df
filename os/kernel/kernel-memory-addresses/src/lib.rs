//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! by the two-level paging and frame management code.
//!
//! ## Overview
//!
//! All higher-level memory abstractions are built from a few principal types:
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory, i.e. frames. |
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: 4 KiB pages (frames, one page table entry); the only size
//!   the two-level paging uses. A directory entry's 4 MiB span is addressed
//!   through its `DirectoryIndex` in `kernel_vmem`.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC040_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0xC040_1000);
//! assert_eq!(off.as_u32(), 0x234);
//! assert_eq!(page.join(off), va);
//!
//! let frame = PhysicalPage::<Size4K>::from_frame_number(0x123);
//! assert_eq!(frame.base().as_u32(), 0x0012_3000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use memory_address::{MemoryAddress, MemoryAddressOffset, MemoryPage};
pub use page_size::{PageSize, Size4K};
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use virtual_address::{VirtualAddress, VirtualPage};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_roundtrip() {
        let va = VirtualAddress::new(0xDEAD_BEEF);
        let (page, off) = va.split::<Size4K>();
        assert_eq!(page.base().as_u32(), 0xDEAD_B000);
        assert_eq!(off.as_u32(), 0xEEF);
        assert_eq!(page.join(off), va);
    }

    #[test]
    fn frame_numbers() {
        let pa = PhysicalAddress::new(0x0040_2ABC);
        let frame = pa.page::<Size4K>();
        assert_eq!(frame.frame_number(), 0x402);
        assert_eq!(PhysicalPage::<Size4K>::from_frame_number(0x402), frame);
        assert_eq!(frame.next(), PhysicalPage::from_frame_number(0x403));
    }

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x1001);
        assert_eq!(a.align_down::<Size4K>().as_u32(), 0x1000);
        assert_eq!(a.align_up::<Size4K>(), Some(MemoryAddress::new(0x2000)));
        assert!(MemoryAddress::new(0x2000).is_aligned::<Size4K>());
        assert!(!a.is_aligned::<Size4K>());
        assert_eq!(MemoryAddress::new(0xFFFF_F001).align_up::<Size4K>(), None);
    }

    #[test]
    fn debug_formatting() {
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x1000)), "PA(0x00001000)");
        assert_eq!(format!("{:?}", VirtualAddress::new(0xC000_0000)), "VA(0xC0000000)");
        assert_eq!(format!("{}", PhysicalPage::<Size4K>::from_frame_number(1)), "0x00001000/4K");
    }

    #[test]
    fn checked_offsets() {
        let va = VirtualAddress::new(0xFFFF_F000);
        assert_eq!(va.checked_add(0xFFF), Some(VirtualAddress::new(0xFFFF_FFFF)));
        assert_eq!(va.checked_add(0x1000), None);
    }
}
