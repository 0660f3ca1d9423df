//! # Virtual Memory Manager
//!
//! Owns the kernel page directory, the frame bitmap behind the heap and the
//! MMU handle. Built once by [`Vmm::init`], which turns on paging.
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────────┐
//!             │ identity map of usable RAM   │  kernel image read-only
//! 0xBFC0_0000 ├──────────────────────────────┤
//!             │ per-task stack slot          │  private table per task
//! 0xC000_0000 ├──────────────────────────────┤
//!             │ (unused)                     │
//! window base ├──────────────────────────────┤
//!             │ heap window                  │  frame i at base + i * 4 KiB
//! 0xFFFF_FFFF └──────────────────────────────┘
//! ```

use crate::frame_alloc::BitmapFrameAlloc;
use kernel_info::boot::BootInfo;
use kernel_info::memory::{
    ENTRIES_PER_TABLE, HEAP_WINDOW_FLOOR, PAGE_SIZE, STACK_SLOT_BASE, STACK_SLOT_PAGE,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{
    AddressSpace, DirectoryIndex, FrameAlloc, MapError, PageAccess, PagingHardware, PhysMapper,
    PhysMapperExt, ThreadData,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("the memory map has no usable region for the heap")]
    NoUsableMemory,
    #[error("bootstrap arena exhausted while building the kernel directory: {0}")]
    BootstrapExhausted(MapError),
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] MapError),
    #[error("memory management is not initialized")]
    Inactive,
}

/// The virtual range the heap frames are mapped into.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapWindow {
    first: DirectoryIndex,
    pages: usize,
}

impl HeapWindow {
    /// Places a window for `pages` frames at the top of the address space.
    ///
    /// Returns `None` if it would reach below [`HEAP_WINDOW_FLOOR`].
    #[must_use]
    pub fn at_top(pages: usize) -> Option<Self> {
        let tables = pages.div_ceil(ENTRIES_PER_TABLE);
        let first = ENTRIES_PER_TABLE.checked_sub(tables)?;
        let window = Self {
            first: DirectoryIndex::new(u16::try_from(first).ok()?),
            pages,
        };
        (window.base().as_u32() >= HEAP_WINDOW_FLOOR).then_some(window)
    }

    /// The largest number of frames a window can hold.
    #[must_use]
    pub const fn capacity() -> usize {
        ((u32::MAX - HEAP_WINDOW_FLOOR) as usize + 1) / PAGE_SIZE as usize
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.first.base()
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Directory indices covered by the window.
    pub fn directory_indices(&self) -> impl Iterator<Item = DirectoryIndex> {
        (self.first.as_usize()..ENTRIES_PER_TABLE).map(|i| DirectoryIndex::new(i as u16))
    }

    #[inline]
    #[must_use]
    pub fn covers(&self, idx: DirectoryIndex) -> bool {
        idx >= self.first
    }

    /// Where bitmap index `i` is mapped.
    #[inline]
    #[must_use]
    pub const fn page_address(&self, i: usize) -> VirtualAddress {
        VirtualAddress::new(self.base().as_u32() + (i as u32) * PAGE_SIZE)
    }

    /// The bitmap index mapped at `va`, if `va` lies in the window.
    #[must_use]
    pub fn index_of(&self, va: VirtualAddress) -> Option<usize> {
        let offset = va.as_u32().checked_sub(self.base().as_u32())?;
        let i = (offset / PAGE_SIZE) as usize;
        (i < self.pages).then_some(i)
    }
}

/// Kernel virtual memory manager.
pub struct Vmm<M: PhysMapper, H: PagingHardware> {
    mapper: M,
    hw: H,
    kernel: PhysicalPage<Size4K>,
    current: PhysicalPage<Size4K>,
    frames: BitmapFrameAlloc,
    window: HeapWindow,
}

impl<M: PhysMapper, H: PagingHardware> Vmm<M, H> {
    /// Builds the kernel directory and enables paging.
    ///
    /// - identity-maps the kernel image read-only and every other usable page
    ///   read-write,
    /// - picks the largest usable region, moved past the kernel image and
    ///   everything below `reserved_end`, as the heap,
    /// - places the heap window at the top of the address space and links its
    ///   (still empty) page tables,
    /// - loads the directory and turns on paging.
    ///
    /// Page tables come from `boot_frames`; `reserved_end` is typically the
    /// limit of the bootstrap arena.
    ///
    /// # Errors
    /// No usable region, or `boot_frames` ran dry.
    pub fn init<A: FrameAlloc + ?Sized>(
        boot_info: BootInfo<'_>,
        boot_frames: &mut A,
        reserved_end: PhysicalAddress,
        mapper: M,
        hw: H,
    ) -> Result<Self, VmmError> {
        let image = boot_info.kernel_image;
        let (heap_start, heap_end) = Self::choose_heap(boot_info, reserved_end)?;

        let mut frames = ((heap_end.as_u32() - heap_start.as_u32()) / PAGE_SIZE) as usize;
        if frames > HeapWindow::capacity() {
            log::warn!(
                "heap region of {frames} frames exceeds the window, using {}",
                HeapWindow::capacity()
            );
            frames = HeapWindow::capacity();
        }
        let window = HeapWindow::at_top(frames).ok_or(VmmError::NoUsableMemory)?;

        let kernel = {
            let space =
                AddressSpace::create(&mapper, boot_frames).map_err(VmmError::BootstrapExhausted)?;
            space
                .identity_map(boot_frames, image.start, image.end, PageAccess::KERNEL_RO)
                .map_err(VmmError::BootstrapExhausted)?;

            for (start, end) in boot_info.available_ranges() {
                for frame in start.as_u32() / PAGE_SIZE..end.as_u32() / PAGE_SIZE {
                    let pa = PhysicalPage::<Size4K>::from_frame_number(frame).base();
                    if image.contains(pa) {
                        continue;
                    }
                    space
                        .map(boot_frames, VirtualAddress::new(pa.as_u32()), pa, PageAccess::KERNEL_RW)
                        .map_err(VmmError::BootstrapExhausted)?;
                }
            }

            for idx in window.directory_indices() {
                space
                    .ensure_table(boot_frames, idx, PageAccess::KERNEL_RW)
                    .map_err(VmmError::BootstrapExhausted)?;
            }

            debug_assert!(
                space
                    .table_page(DirectoryIndex::from(VirtualAddress::new(STACK_SLOT_BASE)))
                    .is_none(),
                "the kernel directory must leave the stack slot empty"
            );
            space.root_page()
        };

        hw.load_directory(kernel);
        hw.enable_paging();
        log::info!(
            "paging enabled: directory {kernel}, heap {heap_start}..{heap_end} ({frames} frames) at {}",
            window.base()
        );

        Ok(Self {
            mapper,
            hw,
            kernel,
            current: kernel,
            frames: BitmapFrameAlloc::new(PhysicalPage::containing_address(heap_start), frames),
            window,
        })
    }

    /// The largest usable range after cutting away the kernel image and
    /// everything up to `reserved_end`.
    fn choose_heap(
        boot_info: BootInfo<'_>,
        reserved_end: PhysicalAddress,
    ) -> Result<(PhysicalAddress, PhysicalAddress), VmmError> {
        let image = boot_info.kernel_image;
        let reserved_end = reserved_end.as_u32().max(image.end.as_u32()).next_multiple_of(PAGE_SIZE);

        boot_info
            .available_ranges()
            .filter_map(|(start, end)| {
                let mut start = start.as_u32();
                if start < reserved_end && image.start.as_u32() < end.as_u32() {
                    start = start.max(reserved_end);
                }
                (start < end.as_u32()).then(|| (PhysicalAddress::new(start), end))
            })
            .max_by_key(|(start, end)| end.as_u32() - start.as_u32())
            .ok_or(VmmError::NoUsableMemory)
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    #[inline]
    #[must_use]
    pub const fn kernel_directory(&self) -> PhysicalPage<Size4K> {
        self.kernel
    }

    #[inline]
    #[must_use]
    pub const fn current_directory(&self) -> PhysicalPage<Size4K> {
        self.current
    }

    #[inline]
    #[must_use]
    pub const fn window(&self) -> HeapWindow {
        self.window
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc {
        &self.frames
    }

    #[inline]
    pub const fn frames_mut(&mut self) -> &mut BitmapFrameAlloc {
        &mut self.frames
    }

    #[inline]
    pub const fn kernel_space(&self) -> AddressSpace<'_, M> {
        AddressSpace::from_root(&self.mapper, self.kernel)
    }

    /// Maps `va` to `pa` in the kernel directory.
    ///
    /// # Errors
    /// No frame left for a page table.
    ///
    /// # Panics
    /// On a conflicting remap.
    pub fn map(&mut self, va: VirtualAddress, pa: PhysicalAddress, access: PageAccess) -> Result<(), VmmError> {
        let space = AddressSpace::from_root(&self.mapper, self.kernel);
        space.map(&mut self.frames, va, pa, access)?;
        Ok(())
    }

    /// Identity-maps `start..end` in the kernel directory.
    ///
    /// # Errors
    /// No frame left for a page table.
    pub fn identity_map(
        &mut self,
        start: PhysicalAddress,
        end: PhysicalAddress,
        access: PageAccess,
    ) -> Result<(), VmmError> {
        let space = AddressSpace::from_root(&self.mapper, self.kernel);
        space.identity_map(&mut self.frames, start, end, access)?;
        Ok(())
    }

    /// Removes the kernel mapping of `va` and flushes it from the TLB.
    pub fn unmap(&mut self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        let frame = self.kernel_space().unmap(va)?;
        self.hw.invalidate_page(va);
        Some(frame)
    }

    /// Translates through the directory that is currently loaded.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        AddressSpace::from_root(&self.mapper, self.current).translate(va)
    }

    /// Loads `directory` into the MMU.
    pub fn switch(&mut self, directory: PhysicalPage<Size4K>) {
        if directory != self.current {
            self.hw.load_directory(directory);
            self.current = directory;
        }
    }

    pub fn switch_to_kernel(&mut self) {
        self.switch(self.kernel);
    }

    /// Records `directory` as current without touching the MMU, for callers
    /// that load CR3 themselves together with a stack switch.
    pub const fn assume_loaded(&mut self, directory: PhysicalPage<Size4K>) {
        self.current = directory;
    }

    /// Creates a task address space: a copy of the kernel directory whose
    /// heap-window tables are shared and which owns one zeroed stack frame
    /// at [`STACK_SLOT_PAGE`].
    ///
    /// # Errors
    /// Out of frames; nothing is leaked.
    pub fn clone_address_space(&mut self) -> Result<ThreadData, VmmError> {
        let kernel = AddressSpace::from_root(&self.mapper, self.kernel);
        let window = self.window;
        let space = kernel.duplicate(&mut self.frames, |idx| window.covers(idx))?;

        let stack_page = VirtualAddress::new(STACK_SLOT_PAGE);
        let stack = space
            .ensure_table(&mut self.frames, DirectoryIndex::from(stack_page), PageAccess::KERNEL_RW)
            .and_then(|table| {
                let frame = self.frames.allocate_frame()?;
                self.mapper.zero_frame(frame);
                if let Err(e) = space.map(&mut self.frames, stack_page, frame.base(), PageAccess::KERNEL_RW) {
                    self.frames.free_frame(frame);
                    return Err(e);
                }
                Ok((table, frame))
            });
        // The stack table is private to the new space and goes with it.
        let (stack_table, stack_frame) = match stack {
            Ok(parts) => parts,
            Err(e) => {
                space.release(&kernel, &mut self.frames);
                return Err(e.into());
            }
        };

        log::debug!(
            "cloned address space {}: stack {stack_frame} at {stack_page}",
            space.root_page()
        );
        Ok(ThreadData {
            directory: space.root_page(),
            stack_table,
            stack_frame,
            stack_page: VirtualPage::containing_address(stack_page),
        })
    }

    /// Frees a task address space created by [`clone_address_space`](Self::clone_address_space).
    ///
    /// Returns the number of frames given back.
    ///
    /// # Panics
    /// If `data` names the kernel directory or the one currently loaded.
    pub fn free_address_space(&mut self, data: ThreadData) -> usize {
        if data.directory == self.kernel || data.directory == self.current {
            log::error!("refusing to free directory {} (kernel or active)", data.directory);
            panic!("cannot free the kernel or the active address space");
        }

        let kernel = AddressSpace::from_root(&self.mapper, self.kernel);
        let space = AddressSpace::from_root(&self.mapper, data.directory);
        debug_assert_eq!(
            space.table_page(DirectoryIndex::from(data.stack_page.base())),
            Some(data.stack_table)
        );
        self.frames.free_frame(data.stack_frame);
        let freed = space.release(&kernel, &mut self.frames) + 1;
        log::debug!("freed address space {} ({freed} frames)", data.directory);
        freed
    }

    /// Bytes of physical memory managed for the heap.
    #[must_use]
    pub const fn heap_size(&self) -> usize {
        self.frames.total_frames() * PAGE_SIZE as usize
    }

    /// Bytes of heap memory not currently allocated.
    #[must_use]
    pub fn free_heap(&self) -> usize {
        self.frames.free_frames() * PAGE_SIZE as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HEAP_FRAMES, KERNEL, boot_frames, boot_vmm};
    use kernel_info::boot::MemoryRegion;
    use kernel_vmem::test_support::{RecordingPaging, SparsePhys, TestFrames};

    #[test]
    fn window_sits_at_the_top() {
        let w = HeapWindow::at_top(1536).unwrap();
        assert_eq!(w.base(), VirtualAddress::new(0xFF80_0000));
        assert_eq!(w.directory_indices().count(), 2);
        assert_eq!(w.page_address(3), VirtualAddress::new(0xFF80_3000));
        assert_eq!(w.index_of(VirtualAddress::new(0xFF80_3FFF)), Some(3));
        assert_eq!(w.index_of(VirtualAddress::new(0xFFFF_F000)), None);
        assert!(HeapWindow::at_top(HeapWindow::capacity() + 1).is_none());
    }

    #[test]
    fn init_builds_identity_map_and_enables_paging() {
        let phys = SparsePhys::new();
        let paging = RecordingPaging::new();
        let vmm = boot_vmm(&phys, &paging);

        assert!(paging.paging_enabled());
        assert_eq!(paging.current(), Some(vmm.kernel_directory()));
        assert_eq!(vmm.current_directory(), vmm.kernel_directory());

        let low = VirtualAddress::new(0x5000);
        assert_eq!(vmm.translate(low), Some(PhysicalAddress::new(0x5000)));
        assert_eq!(vmm.translate(VirtualAddress::new(0xF_0000)), None, "reserved");

        let image = vmm.kernel_space().entry(VirtualAddress::new(0x10_1000)).unwrap();
        assert!(!image.flags().writable());
        let data = vmm.kernel_space().entry(VirtualAddress::new(0x10_3000)).unwrap();
        assert!(data.flags().writable());
    }

    #[test]
    fn heap_starts_past_the_reserved_range() {
        let phys = SparsePhys::new();
        let paging = RecordingPaging::new();
        let mut frames = boot_frames();
        let map = crate::testing::MEMORY_MAP;
        let vmm = Vmm::init(
            BootInfo::new(&map, KERNEL),
            &mut frames,
            crate::testing::RESERVED_END,
            &phys,
            &paging,
        )
        .unwrap();

        assert_eq!(vmm.frames().base().base(), PhysicalAddress::new(0x20_0000));
        assert_eq!(vmm.frames().total_frames(), HEAP_FRAMES);
        assert_eq!(vmm.heap_size(), 0x60_0000);
        assert_eq!(vmm.free_heap(), vmm.heap_size());
        assert_eq!(vmm.window().base(), VirtualAddress::new(0xFF80_0000));
        assert!(vmm.kernel_space().table_page(DirectoryIndex::new(1022)).is_some());
        assert!(vmm.kernel_space().table_page(DirectoryIndex::new(1023)).is_some());
        assert_eq!(frames.allocated(), 5, "directory, two identity tables, two window tables");
    }

    #[test]
    fn init_without_memory_fails() {
        let phys = SparsePhys::new();
        let paging = RecordingPaging::new();
        let mut frames = TestFrames::new(0xE_0000, 4);
        let map = [MemoryRegion::available(0x10_0000, 0x3000)];
        let err = Vmm::init(
            BootInfo::new(&map, KERNEL),
            &mut frames,
            PhysicalAddress::new(0x10_3000),
            &phys,
            &paging,
        )
        .err();
        assert_eq!(err, Some(VmmError::NoUsableMemory));
        assert!(!paging.paging_enabled());
    }

    #[test]
    fn exhausted_boot_frames_are_reported() {
        let phys = SparsePhys::new();
        let paging = RecordingPaging::new();
        let mut frames = TestFrames::new(0xE_0000, 2);
        let map = crate::testing::MEMORY_MAP;
        let err = Vmm::init(
            BootInfo::new(&map, KERNEL),
            &mut frames,
            crate::testing::RESERVED_END,
            &phys,
            &paging,
        )
        .err();
        assert!(matches!(err, Some(VmmError::BootstrapExhausted(_))));
    }

    #[test]
    fn clone_shares_frames_and_owns_its_stack() {
        let phys = SparsePhys::new();
        let paging = RecordingPaging::new();
        let mut vmm = boot_vmm(&phys, &paging);
        let before = vmm.frames().free_frames();

        let data = vmm.clone_address_space().unwrap();
        let task = AddressSpace::from_root(vmm.mapper(), data.directory);
        let stack = VirtualAddress::new(STACK_SLOT_PAGE);

        assert_eq!(task.translate(stack), Some(data.stack_frame.base()));
        assert_eq!(vmm.kernel_space().translate(stack), None);
        assert_eq!(
            task.translate(VirtualAddress::new(0x7000)),
            vmm.kernel_space().translate(VirtualAddress::new(0x7000))
        );
        assert_eq!(data.stack_top(), VirtualAddress::new(0xC000_0000));
        assert_eq!(vmm.frames().free_frames(), before - 5);

        vmm.switch(data.directory);
        assert_eq!(paging.current(), Some(data.directory));
        assert_eq!(vmm.translate(stack), Some(data.stack_frame.base()));
        vmm.switch_to_kernel();
        assert_eq!(vmm.translate(stack), None);

        assert_eq!(vmm.free_address_space(data), 5);
        assert_eq!(vmm.frames().free_frames(), before);
    }

    #[test]
    fn failed_clones_give_every_frame_back() {
        // A clone takes five frames; run out at each of them in turn.
        for left in 0..5 {
            let phys = SparsePhys::new();
            let paging = RecordingPaging::new();
            let mut vmm = boot_vmm(&phys, &paging);
            let total = vmm.frames().total_frames();
            let free: Vec<usize> = (0..total).filter(|&i| !vmm.frames().bitmap().test(i)).collect();
            for &i in &free[left..] {
                vmm.frames_mut().bitmap_mut().set(i);
            }
            let before = vmm.frames().bitmap().clone();

            assert!(vmm.clone_address_space().is_err(), "{left} frame(s) left");
            assert_eq!(vmm.frames().bitmap(), &before, "{left} frame(s) left");
            assert_eq!(vmm.frames().free_frames(), left);
        }
    }

    #[test]
    fn stack_frame_starts_zeroed() {
        let phys = SparsePhys::new();
        let paging = RecordingPaging::new();
        let mut vmm = boot_vmm(&phys, &paging);

        let first = vmm.clone_address_space().unwrap();
        let frame = first.stack_frame;
        phys.write_u32(frame.base() + 0x100, 0xFEED_F00D);
        vmm.free_address_space(first);

        let second = vmm.clone_address_space().unwrap();
        assert_eq!(phys.read_u32(second.stack_frame.base() + 0x100), 0);
        vmm.free_address_space(second);
    }

    #[test]
    fn heap_mappings_after_clone_are_visible_in_the_clone() {
        let phys = SparsePhys::new();
        let paging = RecordingPaging::new();
        let mut vmm = boot_vmm(&phys, &paging);

        let data = vmm.clone_address_space().unwrap();
        let va = vmm.window().page_address(5);
        vmm.map(va, PhysicalAddress::new(0x30_0000), PageAccess::KERNEL_RW).unwrap();

        let task = AddressSpace::from_root(vmm.mapper(), data.directory);
        assert_eq!(task.translate(va), Some(PhysicalAddress::new(0x30_0000)));

        assert_eq!(vmm.unmap(va), Some(PhysicalPage::containing_address(PhysicalAddress::new(0x30_0000))));
        assert_eq!(paging.invalidations(), 1);
        vmm.free_address_space(data);
    }

    #[test]
    #[should_panic(expected = "kernel or the active")]
    fn freeing_the_active_space_is_fatal() {
        let phys = SparsePhys::new();
        let paging = RecordingPaging::new();
        let mut vmm = boot_vmm(&phys, &paging);
        let data = vmm.clone_address_space().unwrap();
        vmm.switch(data.directory);
        vmm.free_address_space(data);
    }
}
