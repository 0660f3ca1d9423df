//! # Page Heap
//!
//! Page-granular kernel heap. Every allocation occupies a run of whole frames
//! from the [`FrameBitmap`](crate::frame_alloc::FrameBitmap), mapped into the
//! heap window at `base + index * 4 KiB`, and starts with an
//! [`AllocationHeader`]. The caller gets the address just past the header.
//!
//! ```text
//! window + i * 4 KiB
//! ┌────────┬──────┬─────────────────────────────┐
//! │ magic  │ size │ payload ...                 │ ... (pages - 1) more pages
//! └────────┴──────┴─────────────────────────────┘
//!                 ^ returned pointer
//! ```
//!
//! Header and payload are accessed through the physical frames, so the heap
//! works the same whichever directory is loaded.

use crate::vmm::Vmm;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{PageAccess, PagingHardware, PhysMapper, PhysMapperExt};

/// Marks the start of every live heap allocation.
pub const HEAP_MAGIC: u32 = 0x1238_90AB;

/// Bytes in front of every payload.
pub const HEADER_SIZE: usize = size_of::<AllocationHeader>();

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("no run of free frames is large enough")]
    OutOfMemory,
    #[error("the frames after the allocation are in use")]
    NeighborsOccupied,
    #[error("the heap is not active yet")]
    NotActive,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllocationHeader {
    pub magic: u32,
    /// Requested size in bytes, without the header.
    pub size: u32,
}

/// Frames needed for a request of `size` bytes, or `None` if the request
/// plus its header does not fit the address width.
///
/// Zero-byte requests still take one page.
#[inline]
#[must_use]
pub const fn pages_for(size: usize) -> Option<usize> {
    match size.checked_add(HEADER_SIZE) {
        Some(total) => Some(total.div_ceil(PAGE_SIZE as usize)),
        None => None,
    }
}

/// A live allocation resolved from a pointer.
#[derive(Debug, Copy, Clone)]
struct Span {
    start: usize,
    pages: usize,
    size: usize,
}

/// Allocation bookkeeping on top of a [`Vmm`]'s frame bitmap and heap window.
#[derive(Debug, Default)]
pub struct PageHeap {
    live: usize,
}

impl PageHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self { live: 0 }
    }

    /// Number of allocations not yet freed.
    #[inline]
    #[must_use]
    pub const fn live_allocations(&self) -> usize {
        self.live
    }

    /// Allocates `size` bytes.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if no run of free frames is long enough.
    pub fn allocate<M: PhysMapper, H: PagingHardware>(
        &mut self,
        vmm: &mut Vmm<M, H>,
        size: usize,
    ) -> Result<VirtualAddress, HeapError> {
        let pages = pages_for(size).ok_or(HeapError::OutOfMemory)?;
        let size32 = u32::try_from(size).map_err(|_| HeapError::OutOfMemory)?;
        let start = vmm
            .frames()
            .bitmap()
            .find_free_span(pages)
            .ok_or(HeapError::OutOfMemory)?;

        vmm.frames_mut().bitmap_mut().mark_span(start, pages);
        Self::map_pages(vmm, start, pages)?;
        Self::write_header(vmm, start, size32);
        self.live += 1;

        let ptr = Self::payload(vmm, start);
        log::debug!("heap: {size} bytes in {pages} page(s) at {ptr}");
        Ok(ptr)
    }

    /// Frees the allocation at `ptr`; returns the number of pages released.
    ///
    /// # Panics
    /// If `ptr` was not returned by this heap or its header is corrupt.
    pub fn free<M: PhysMapper, H: PagingHardware>(&mut self, vmm: &mut Vmm<M, H>, ptr: VirtualAddress) -> usize {
        let span = Self::resolve(vmm, ptr);
        Self::release_pages(vmm, span.start, span.pages);
        self.live -= 1;
        log::debug!("heap: freed {} page(s) at {ptr}", span.pages);
        span.pages
    }

    /// The requested size recorded for the allocation at `ptr`.
    ///
    /// # Panics
    /// As [`free`](Self::free).
    #[must_use]
    pub fn size_of<M: PhysMapper, H: PagingHardware>(vmm: &Vmm<M, H>, ptr: VirtualAddress) -> usize {
        Self::resolve(vmm, ptr).size
    }

    /// Resizes the allocation at `ptr`.
    ///
    /// Shrinking releases the trailing pages and keeps the pointer. Growing
    /// keeps the pointer if the following frames are free; otherwise the
    /// allocation moves to a new run, carrying over the old contents.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if it must move and no run is long enough.
    /// The original allocation is untouched in that case.
    ///
    /// # Panics
    /// As [`free`](Self::free).
    pub fn reallocate<M: PhysMapper, H: PagingHardware>(
        &mut self,
        vmm: &mut Vmm<M, H>,
        ptr: VirtualAddress,
        new_size: usize,
    ) -> Result<VirtualAddress, HeapError> {
        let span = Self::resolve(vmm, ptr);
        match Self::resize_in_place(vmm, span, new_size) {
            Ok(()) => return Ok(ptr),
            Err(HeapError::NeighborsOccupied) => {}
            Err(e) => return Err(e),
        }

        let new_pages = pages_for(new_size).ok_or(HeapError::OutOfMemory)?;
        let new_size32 = u32::try_from(new_size).map_err(|_| HeapError::OutOfMemory)?;
        let start = vmm
            .frames()
            .bitmap()
            .find_free_span(new_pages)
            .ok_or(HeapError::OutOfMemory)?;

        vmm.frames_mut().bitmap_mut().mark_span(start, new_pages);
        Self::map_pages(vmm, start, new_pages)?;

        // Whole frames: the header is rewritten right after.
        for k in 0..span.pages.min(new_pages) {
            let src = vmm.frames().frame(span.start + k);
            let dst = vmm.frames().frame(start + k);
            *vmm.mapper().frame_mut(dst) = *vmm.mapper().frame_mut(src);
        }
        Self::write_header(vmm, start, new_size32);
        Self::release_pages(vmm, span.start, span.pages);

        let moved = Self::payload(vmm, start);
        log::debug!("heap: moved {ptr} to {moved} ({new_size} bytes)");
        Ok(moved)
    }

    /// Resizes the allocation at `ptr` without moving it.
    ///
    /// # Errors
    /// [`HeapError::NeighborsOccupied`] if growing would need frames that are
    /// in use (or lie past the heap). Nothing changes in that case.
    ///
    /// # Panics
    /// As [`free`](Self::free).
    pub fn try_grow_in_place<M: PhysMapper, H: PagingHardware>(
        vmm: &mut Vmm<M, H>,
        ptr: VirtualAddress,
        new_size: usize,
    ) -> Result<VirtualAddress, HeapError> {
        let span = Self::resolve(vmm, ptr);
        Self::resize_in_place(vmm, span, new_size)?;
        Ok(ptr)
    }

    fn resize_in_place<M: PhysMapper, H: PagingHardware>(
        vmm: &mut Vmm<M, H>,
        span: Span,
        new_size: usize,
    ) -> Result<(), HeapError> {
        let new_pages = pages_for(new_size).ok_or(HeapError::NeighborsOccupied)?;
        let new_size32 = u32::try_from(new_size).map_err(|_| HeapError::NeighborsOccupied)?;

        if new_pages <= span.pages {
            Self::release_pages(vmm, span.start + new_pages, span.pages - new_pages);
        } else {
            let last = span.start + span.pages - 1;
            let extra = new_pages - span.pages;
            if vmm.frames().bitmap().free_slots_after(last) < extra {
                return Err(HeapError::NeighborsOccupied);
            }
            vmm.frames_mut().bitmap_mut().mark_span(last + 1, extra);
            Self::map_pages(vmm, last + 1, extra)?;
        }

        Self::write_header(vmm, span.start, new_size32);
        Ok(())
    }

    /// Finds the allocation `ptr` points into the start of.
    fn resolve<M: PhysMapper, H: PagingHardware>(vmm: &Vmm<M, H>, ptr: VirtualAddress) -> Span {
        let window = vmm.window();
        let start = ptr
            .as_u32()
            .checked_sub(HEADER_SIZE as u32)
            .map(VirtualAddress::new)
            .filter(|base| base.as_u32() % PAGE_SIZE == 0)
            .and_then(|base| window.index_of(base));
        let Some(start) = start else {
            log::error!("heap: {ptr} is not a heap pointer (window at {})", window.base());
            panic!("pointer outside the heap window");
        };

        if !vmm.frames().bitmap().test(start) {
            log::error!("heap: {ptr} refers to free memory");
            panic!("pointer to an unallocated heap span");
        }

        let header = *Self::header(vmm, vmm.frames().frame(start));
        let size = header.size as usize;
        let pages = pages_for(size);
        if header.magic != HEAP_MAGIC || pages.is_none() {
            log::error!(
                "heap: corrupt header at {ptr}: magic {:#010x}, size {}",
                header.magic,
                header.size
            );
            panic!("heap header magic mismatch");
        }

        Span {
            start,
            pages: pages.unwrap_or_default(),
            size,
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn header<M: PhysMapper, H: PagingHardware>(
        vmm: &Vmm<M, H>,
        frame: PhysicalPage<Size4K>,
    ) -> &mut AllocationHeader {
        unsafe { vmm.mapper().phys_to_mut(frame.base()) }
    }

    fn write_header<M: PhysMapper, H: PagingHardware>(vmm: &Vmm<M, H>, start: usize, size: u32) {
        *Self::header(vmm, vmm.frames().frame(start)) = AllocationHeader {
            magic: HEAP_MAGIC,
            size,
        };
    }

    fn payload<M: PhysMapper, H: PagingHardware>(vmm: &Vmm<M, H>, start: usize) -> VirtualAddress {
        vmm.window().page_address(start) + HEADER_SIZE as u32
    }

    /// Maps bitmap indices `start..start + n` into the window. The bits must
    /// already be set; they are cleared again on failure.
    fn map_pages<M: PhysMapper, H: PagingHardware>(
        vmm: &mut Vmm<M, H>,
        start: usize,
        n: usize,
    ) -> Result<(), HeapError> {
        let window = vmm.window();
        for i in start..start + n {
            let frame = vmm.frames().frame(i);
            if let Err(e) = vmm.map(window.page_address(i), frame.base(), PageAccess::KERNEL_RW) {
                log::error!("heap: mapping window page {i} failed: {e}");
                Self::release_pages(vmm, start, i - start);
                vmm.frames_mut().bitmap_mut().release_span(i, start + n - i);
                return Err(HeapError::OutOfMemory);
            }
        }
        Ok(())
    }

    /// Unmaps bitmap indices `start..start + n` and clears their bits.
    /// Headers are left in place.
    fn release_pages<M: PhysMapper, H: PagingHardware>(vmm: &mut Vmm<M, H>, start: usize, n: usize) {
        let window = vmm.window();
        for i in start..start + n {
            vmm.unmap(window.page_address(i));
        }
        vmm.frames_mut().bitmap_mut().release_span(start, n);
    }
}
