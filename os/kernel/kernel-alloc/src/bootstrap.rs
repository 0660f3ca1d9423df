//! # Bootstrap Allocator
//!
//! Bump allocator serving all allocations before the paged heap exists: the
//! frame bitmap, boot page tables and whatever the global allocator is asked
//! for during early init. It carves memory from an arena that starts at the
//! page-aligned end of the kernel image.
//!
//! Nothing handed out here is ever freed.

use kernel_info::boot::BootInfo;
use kernel_info::memory::{BOOTSTRAP_ARENA_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, FrameAllocError};

/// Minimum alignment of every bootstrap allocation.
pub const BOOTSTRAP_ALIGN: u32 = 8;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap arena exhausted: {requested} bytes requested, {left} left")]
    Exhausted { requested: u32, left: u32 },
}

/// Placement allocator over `[start, limit)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootstrapAlloc {
    start: u32,
    next: u32,
    limit: u32,
}

impl BootstrapAlloc {
    /// An arena without any memory; every request fails.
    pub const EMPTY: Self = Self {
        start: 0,
        next: 0,
        limit: 0,
    };

    /// An arena over `[start, limit)`. `start` is rounded up to a page.
    #[must_use]
    pub const fn new(start: PhysicalAddress, limit: PhysicalAddress) -> Self {
        let start = start.as_u32().next_multiple_of(PAGE_SIZE);
        let limit = if limit.as_u32() < start { start } else { limit.as_u32() };
        Self {
            start,
            next: start,
            limit,
        }
    }

    /// The arena for this boot: from the page-aligned end of the kernel image,
    /// [`BOOTSTRAP_ARENA_SIZE`] bytes or up to the end of the available region
    /// containing the image, whichever is smaller.
    #[must_use]
    pub fn for_boot(boot_info: BootInfo<'_>) -> Self {
        let start = boot_info.kernel_image.end.as_u32().next_multiple_of(PAGE_SIZE);
        let wanted = start.saturating_add(BOOTSTRAP_ARENA_SIZE);
        let limit = boot_info
            .available_ranges()
            .find(|(s, e)| s.as_u32() <= start && start < e.as_u32())
            .map_or(start, |(_, e)| wanted.min(e.as_u32()));
        Self::new(PhysicalAddress::new(start), PhysicalAddress::new(limit))
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start)
    }

    /// End of the arena; nothing at or beyond is ever handed out.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.limit)
    }

    #[inline]
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.next - self.start
    }

    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.limit - self.next
    }

    /// Whether `pa` was (or could be) handed out by this arena.
    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u32() >= self.start && pa.as_u32() < self.limit
    }

    fn bump(&mut self, size: u32, align: u32) -> Result<PhysicalAddress, BootstrapError> {
        let exhausted = BootstrapError::Exhausted {
            requested: size,
            left: self.remaining(),
        };
        let at = self
            .next
            .checked_next_multiple_of(align)
            .ok_or(exhausted)?;
        let end = at.checked_add(size.max(1)).ok_or(exhausted)?;
        if end > self.limit {
            return Err(exhausted);
        }
        self.next = end;
        Ok(PhysicalAddress::new(at))
    }

    /// Allocates `size` bytes, 8-byte aligned.
    ///
    /// # Errors
    /// The arena is exhausted.
    pub fn allocate(&mut self, size: u32) -> Result<PhysicalAddress, BootstrapError> {
        self.bump(size, BOOTSTRAP_ALIGN)
    }

    /// Allocates `size` bytes starting on a page boundary and returns the
    /// physical address, for structures the MMU reads directly.
    ///
    /// # Errors
    /// The arena is exhausted.
    pub fn allocate_page_aligned(&mut self, size: u32) -> Result<PhysicalAddress, BootstrapError> {
        let pa = self.bump(size, PAGE_SIZE)?;
        log::trace!("bootstrap: {size} page-aligned bytes at {pa}");
        Ok(pa)
    }
}

impl FrameAlloc for BootstrapAlloc {
    fn allocate_frame(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        self.allocate_page_aligned(PAGE_SIZE)
            .map(PhysicalPage::containing_address)
            .map_err(|_| FrameAllocError::OutOfMemory)
    }

    fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        log::error!("attempt to free bootstrap frame {frame}");
        panic!("bootstrap memory is never freed");
    }
}
