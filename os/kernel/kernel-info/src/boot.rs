//! # Kernel Boot Information

use crate::memory::{IDENTITY_LIMIT, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K};

/// Classification of a physical memory region, following the multiboot
/// memory map type codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Usable RAM.
    Available,
    /// Firmware or device reserved.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective RAM.
    BadMemory,
}

impl MemoryRegionKind {
    /// Converts a multiboot `type` field.
    #[must_use]
    pub const fn from_multiboot(kind: u32) -> Self {
        match kind {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Reserved,
        }
    }
}

/// One entry of the physical memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn available(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Available)
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Available)
    }

    /// The page-aligned part of this region below [`IDENTITY_LIMIT`], as a
    /// half-open physical range.
    ///
    /// Returns `None` if nothing usable remains after alignment and clamping.
    #[must_use]
    pub fn usable_range(&self) -> Option<(PhysicalAddress, PhysicalAddress)> {
        let limit = u64::from(IDENTITY_LIMIT);
        let page = u64::from(PAGE_SIZE);
        let start = self.base.div_ceil(page) * page;
        let end = (self.end().min(limit) / page) * page;
        if start >= end {
            return None;
        }

        let start = PhysicalAddress::new(u32::try_from(start).ok()?);
        let end = PhysicalAddress::new(u32::try_from(end).ok()?);
        debug_assert!(start.is_aligned::<Size4K>() && end.is_aligned::<Size4K>());
        Some((start, end))
    }
}

/// Physical extent of the loaded kernel image (start inclusive, end exclusive).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl KernelImage {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u32() >= self.start.as_u32() && addr.as_u32() < self.end.as_u32()
    }
}

/// Everything the memory manager needs from the boot loader.
#[derive(Copy, Clone, Debug)]
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryRegion],
    pub kernel_image: KernelImage,
}

impl<'a> BootInfo<'a> {
    #[must_use]
    pub const fn new(memory_map: &'a [MemoryRegion], kernel_image: KernelImage) -> Self {
        Self {
            memory_map,
            kernel_image,
        }
    }

    /// Iterates the usable ranges of all available regions.
    pub fn available_ranges(self) -> impl Iterator<Item = (PhysicalAddress, PhysicalAddress)> + 'a {
        self.memory_map
            .iter()
            .filter(|r| r.is_available())
            .filter_map(MemoryRegion::usable_range)
    }
}
