//! # Virtual Memory Support
//!
//! 32-bit two-level paging for the kernel: typed page directory and page table
//! entries, an [`AddressSpace`] handle to build and inspect one directory tree,
//! and the small interfaces through which the paging code reaches physical
//! memory ([`PhysMapper`]), frames ([`FrameAlloc`]) and the MMU
//! ([`PagingHardware`]).
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22     | 21‒12   | 11‒0   |
//! | directory | table   | offset |
//!
//!  CR3 → PD ──► PDE → PT ──► PTE → 4 KiB frame
//! ```
//!
//! Each level holds 1024 entries of 4 bytes. A directory entry covers 4 MiB of
//! virtual space; a table entry maps a single 4 KiB page.
//!
//! ## Physical access
//!
//! The kernel identity-maps all usable RAM, so on the target a physical
//! address can be dereferenced directly. Tests substitute a sparse simulated
//! memory (see `test_support`) and a recording MMU.

#![cfg_attr(not(any(test, doctest, feature = "test-support")), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
mod page_entry_bits;
pub mod page_table;
mod thread;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::page_entry_bits::{PageAccess, PageEntryBits};
pub use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
pub use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
pub use crate::thread::{ThreadData, ThreadMemory};
pub use kernel_info::memory as info;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Source of physical 4 KiB frames for page tables, directories and heap
/// backing.
pub trait FrameAlloc {
    /// Allocate one frame. The content is undefined.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no frame is left.
    fn allocate_frame(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError>;

    /// Return a frame obtained from [`allocate_frame`](Self::allocate_frame).
    fn free_frame(&mut self, frame: PhysicalPage<Size4K>);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical frames")]
    OutOfMemory,
}

/// Converts physical addresses to usable references in the current virtual
/// address space.
///
/// # Safety
/// Implementations must return references to memory that is writable for
/// the lifetime `'a`; callers pick `T` matching the bytes at `pa` and must not
/// hold two overlapping mutable references at once.
pub trait PhysMapper {
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Typed views of whole frames, for every [`PhysMapper`].
pub trait PhysMapperExt: PhysMapper {
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn directory_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageDirectory {
        unsafe { self.phys_to_mut::<PageDirectory>(page.base()) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn frame_mut(&self, page: PhysicalPage<Size4K>) -> &mut [u8; PAGE_SIZE as usize] {
        unsafe { self.phys_to_mut::<[u8; PAGE_SIZE as usize]>(page.base()) }
    }

    #[inline]
    fn zero_frame(&self, page: PhysicalPage<Size4K>) {
        self.frame_mut(page).fill(0);
    }
}

impl<M: PhysMapper + ?Sized> PhysMapperExt for M {}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// The MMU controls the kernel touches.
pub trait PagingHardware {
    /// Make `directory` the active page directory (write CR3).
    fn load_directory(&self, directory: PhysicalPage<Size4K>);

    /// Turn on paging (set CR0.PG). A directory must be loaded.
    fn enable_paging(&self);

    /// Drop a stale translation for `va` from the TLB.
    fn invalidate_page(&self, va: VirtualAddress) {
        let _ = va;
    }

    /// The linear address of the most recent page fault (CR2).
    fn fault_address(&self) -> VirtualAddress;
}

impl<H: PagingHardware + ?Sized> PagingHardware for &H {
    fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        (**self).load_directory(directory);
    }

    fn enable_paging(&self) {
        (**self).enable_paging();
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }

    fn fault_address(&self) -> VirtualAddress {
        (**self).fault_address()
    }
}

/// Paging through the control registers of the executing CPU.
///
/// # Privilege
/// Ring 0 only; every method touches a control register.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Paging;

#[cfg(target_arch = "x86")]
impl PagingHardware for X86Paging {
    fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;
        unsafe { Cr3::from_directory(directory).store_unsafe() }
    }

    fn enable_paging(&self) {
        use kernel_registers::cr0::Cr0;
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
        unsafe {
            let cr0 = Cr0::load_unsafe();
            cr0.with_pg_paging(true).store_unsafe();
        }
    }

    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
        }
    }

    fn fault_address(&self) -> VirtualAddress {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr2::Cr2;
        unsafe { Cr2::load_unsafe().fault_address() }
    }
}

/// Physical memory that is identity-mapped (or not yet paged at all), so a
/// physical address is also a valid pointer.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityMapper;

#[cfg(target_arch = "x86")]
impl PhysMapper for IdentityMapper {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *(pa.as_usize() as *mut T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SparsePhys;

    #[test]
    fn zero_frame_clears_all_bytes() {
        let phys = SparsePhys::new();
        let page = PhysicalPage::from_frame_number(3);
        phys.frame_mut(page).fill(0xAA);
        phys.zero_frame(page);
        assert!(phys.frame_mut(page).iter().all(|&b| b == 0));
    }

    #[test]
    fn typed_views_share_the_frame() {
        let phys = SparsePhys::new();
        let page = PhysicalPage::from_frame_number(8);
        phys.table_mut(page)
            .set(TableIndex::new(1), PtEntry::make_4k(PhysicalPage::from_frame_number(0x77), PageAccess::KERNEL_RW.entry_bits()));
        assert_eq!(phys.read_u32(page.base() + 4), 0x0007_7003);
    }
}
