//! Fixtures shared by the unit tests of this crate.

use crate::vmm::Vmm;
use kernel_info::boot::{BootInfo, KernelImage, MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::test_support::{RecordingPaging, SparsePhys, TestFrames};

pub const KERNEL: KernelImage =
    KernelImage::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x10_3000));

/// End of the range reserved for boot structures; the heap starts here.
pub const RESERVED_END: PhysicalAddress = PhysicalAddress::new(0x20_0000);

/// 8 MiB machine: low memory, a reserved hole, and the main region holding the
/// kernel. The heap gets `0x20_0000..0x80_0000` (1536 frames).
pub const MEMORY_MAP: [MemoryRegion; 3] = [
    MemoryRegion::available(0, 0x9_F000),
    MemoryRegion::new(0xF_0000, 0x1_0000, MemoryRegionKind::Reserved),
    MemoryRegion::available(0x10_0000, 0x70_0000),
];

pub const HEAP_FRAMES: usize = 1536;

/// Frames for boot page tables, far away from everything mapped.
pub fn boot_frames() -> TestFrames {
    TestFrames::new(0xE_0000, 64)
}

pub fn boot_vmm<'p>(
    phys: &'p SparsePhys,
    paging: &'p RecordingPaging,
) -> Vmm<&'p SparsePhys, &'p RecordingPaging> {
    Vmm::init(
        BootInfo::new(&MEMORY_MAP, KERNEL),
        &mut boot_frames(),
        RESERVED_END,
        phys,
        paging,
    )
    .expect("test machine boots")
}
