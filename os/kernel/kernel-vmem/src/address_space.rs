//! # Address Space (two-level, directory-rooted)
//!
//! Strongly-typed helpers to build and manipulate a single virtual address
//! space, the tree rooted at one [`PageDirectory`].
//!
//! ## Highlights
//!
//! - [`AddressSpace::map`] installs one 4 KiB mapping, allocating a zeroed
//!   page table on demand. Mapping the same pair twice is a no-op; changing an
//!   existing mapping is a fatal error.
//! - [`AddressSpace::identity_map`] maps a physical range onto itself.
//! - [`AddressSpace::translate`] walks the tree without allocating.
//! - [`AddressSpace::duplicate`] and [`AddressSpace::release`] implement the
//!   per-task clone and teardown against a template space.
//!
//! ## Safety
//!
//! - Mutating active mappings requires TLB maintenance; [`unmap`](AddressSpace::unmap)
//!   returns the old frame and leaves `invlpg` to the caller.
//! - The provided [`PhysMapper`] must yield writable references to table frames.

use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
use crate::page_table::split_indices;
use crate::{FrameAlloc, FrameAllocError, PageAccess, PageEntryBits, PhysMapper, PhysMapperExt};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no frame left for a page table: {0}")]
    OutOfMemory(#[from] FrameAllocError),

    #[error("paging is not set up yet")]
    PagingInactive,
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocates and zeroes a fresh, empty page directory.
    ///
    /// # Errors
    /// Propagates allocation failures.
    pub fn create<A: FrameAlloc + ?Sized>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.allocate_frame()?;
        *mapper.directory_mut(root) = PageDirectory::zeroed();
        Ok(Self { root, mapper })
    }

    /// View an existing directory.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// Physical page of the page directory; the value CR3 is loaded with.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    fn directory(&self) -> &mut PageDirectory {
        self.mapper.directory_mut(self.root)
    }

    #[inline]
    #[must_use]
    pub fn directory_entry(&self, idx: DirectoryIndex) -> PdEntry {
        self.directory().get(idx)
    }

    /// The page table linked at `idx`, if any.
    #[inline]
    #[must_use]
    pub fn table_page(&self, idx: DirectoryIndex) -> Option<PhysicalPage<Size4K>> {
        self.directory_entry(idx).table()
    }

    /// Links an existing page table at `idx`, replacing whatever was there.
    pub fn set_table(&self, idx: DirectoryIndex, table: PhysicalPage<Size4K>, access: PageAccess) {
        self.directory()
            .set(idx, PdEntry::make_table(table, access.entry_bits()));
    }

    /// Returns the page table at `idx`, allocating and linking a zeroed one
    /// if the entry is not present.
    ///
    /// A present entry that lacks the user bit gets it when `access.user` is
    /// requested; directory entries are never downgraded.
    ///
    /// # Errors
    /// Propagates allocation failures.
    pub fn ensure_table<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        idx: DirectoryIndex,
        access: PageAccess,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let pde = self.directory_entry(idx);
        if let Some(table) = pde.table() {
            if access.user && !pde.flags().user_access() {
                self.directory()
                    .set(idx, PdEntry::from_raw(pde.flags().with_user_access(true).into_bits()));
            }
            return Ok(table);
        }

        let table = alloc.allocate_frame()?;
        *self.mapper.table_mut(table) = PageTable::zeroed();
        // Directory entries are always writable; leaf entries restrict access.
        let link = PageAccess {
            writable: true,
            user: access.user,
        };
        self.set_table(idx, table, link);
        log::trace!("new page table {table} for {}", idx.base());
        Ok(table)
    }

    /// Maps the 4 KiB page at `va` to the frame at `pa`.
    ///
    /// # Errors
    /// Propagates allocation failures of a missing page table.
    ///
    /// # Panics
    /// If `va` is already mapped to a different frame or with different
    /// permissions.
    pub fn map<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        access: PageAccess,
    ) -> Result<(), MapError> {
        debug_assert!(pa.is_aligned::<Size4K>(), "physical address not aligned");
        let (di, ti) = split_indices(va);
        let frame = PhysicalPage::<Size4K>::containing_address(pa);
        let wanted = access.entry_bits();

        let table = self.mapper.table_mut(self.ensure_table(alloc, di, access)?);
        if let Some((existing, bits)) = table.get(ti).page() {
            if existing == frame && bits.same_access(&wanted) {
                return Ok(());
            }
            log::error!("conflicting remap of {va}: {existing} ({bits:?}) -> {frame} ({wanted:?})");
            panic!("conflicting remap of {va}");
        }

        table.set(ti, PtEntry::make_4k(frame, wanted));
        Ok(())
    }

    /// Clears the mapping of the page at `va`, returning the frame it pointed
    /// to. The page table itself stays linked.
    pub fn unmap(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        let (di, ti) = split_indices(va);
        let table = self.mapper.table_mut(self.table_page(di)?);
        let (frame, _) = table.get(ti).page()?;
        table.set(ti, PtEntry::zero());
        Some(frame)
    }

    /// The leaf entry for `va`, if its table exists and the entry is present.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let (di, ti) = split_indices(va);
        let e = self.mapper.table_mut(self.table_page(di)?).get(ti);
        e.is_present().then_some(e)
    }

    /// Translates `va` to the physical address it maps to, if present.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (frame, _) = self.entry(va)?.page()?;
        Some(frame.join(va.offset::<Size4K>()))
    }

    /// Maps every page of `start..end` onto itself.
    ///
    /// `start` is rounded down and `end` up to page boundaries.
    ///
    /// # Errors
    /// Propagates allocation failures of missing page tables.
    pub fn identity_map<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        start: PhysicalAddress,
        end: PhysicalAddress,
        access: PageAccess,
    ) -> Result<(), MapError> {
        let first = start.as_u32() / PAGE_SIZE;
        let last = end.as_u32().div_ceil(PAGE_SIZE);
        for frame in first..last {
            let pa = PhysicalPage::<Size4K>::from_frame_number(frame).base();
            self.map(alloc, VirtualAddress::new(pa.as_u32()), pa, access)?;
        }
        Ok(())
    }

    /// Creates a new directory that maps everything this one maps.
    ///
    /// Entries for which `share` returns `true` link the very same page table;
    /// every other present entry gets a private copy of its table, so later
    /// changes to one space's table at that index are not seen by the other.
    /// Mapped frames are referenced, never copied.
    ///
    /// # Errors
    /// Allocation failure; all frames taken so far are returned first.
    pub fn duplicate<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        share: impl Fn(DirectoryIndex) -> bool,
    ) -> Result<AddressSpace<'m, M>, MapError> {
        let copy = AddressSpace::create(self.mapper, alloc)?;

        for idx in DirectoryIndex::all() {
            let pde = self.directory_entry(idx);
            let Some(table) = pde.table() else {
                continue;
            };

            if share(idx) {
                copy.directory().set(idx, pde);
                continue;
            }

            let private = match alloc.allocate_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    copy.release(self, alloc);
                    return Err(e.into());
                }
            };
            *self.mapper.frame_mut(private) = *self.mapper.frame_mut(table);
            copy.directory()
                .set(idx, PdEntry::make_table(private, pde.flags()));
        }

        Ok(copy)
    }

    /// Returns this space's directory and every page table it does not share
    /// with `template` to `alloc`. Mapped frames are left alone.
    ///
    /// Returns the number of frames freed.
    ///
    /// # Panics
    /// If this space and `template` have the same directory.
    pub fn release<A: FrameAlloc + ?Sized>(self, template: &AddressSpace<'_, M>, alloc: &mut A) -> usize {
        assert_ne!(
            self.root, template.root,
            "refusing to release the template directory"
        );

        let mut freed = 0;
        for idx in DirectoryIndex::all() {
            let Some(table) = self.table_page(idx) else {
                continue;
            };
            if template.table_page(idx) != Some(table) {
                alloc.free_frame(table);
                freed += 1;
            }
        }

        alloc.free_frame(self.root);
        freed + 1
    }

    /// Iterates the present leaf mappings of the table at `idx`.
    pub fn mappings_in(
        &self,
        idx: DirectoryIndex,
    ) -> impl Iterator<Item = (VirtualAddress, PhysicalPage<Size4K>, PageEntryBits)> + '_ {
        let table = self.table_page(idx).map(|t| &*self.mapper.table_mut(t));
        (0..crate::info::ENTRIES_PER_TABLE as u16).filter_map(move |i| {
            let ti = TableIndex::new(i);
            let (frame, bits) = table?.get(ti).page()?;
            Some((crate::page_table::join_indices(idx, ti), frame, bits))
        })
    }
}
