//! # Memory Layout

/// Size of a frame and of a page table entry's mapping.
pub const PAGE_SIZE: u32 = 4096;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Bytes covered by one page directory entry.
pub const DIRECTORY_ENTRY_SPAN: u32 = PAGE_SIZE * ENTRIES_PER_TABLE as u32;

/// Where the boot loader places the kernel image in physical memory.
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Base of the per-task private stack slot (one directory entry).
///
/// Every task address space maps its private stack frame into the top page of
/// this slot; the kernel directory never maps anything here.
pub const STACK_SLOT_BASE: u32 = 0xBFC0_0000;

/// The page inside the stack slot that holds a task's stack frame.
pub const STACK_SLOT_PAGE: u32 = STACK_SLOT_BASE + DIRECTORY_ENTRY_SPAN - PAGE_SIZE;

/// Physical memory at or above this address is neither identity-mapped nor
/// used as heap backing.
pub const IDENTITY_LIMIT: u32 = STACK_SLOT_BASE;

/// Upper bound for the bump arena that serves allocations before the heap is
/// active, starting at the page-aligned end of the kernel image.
pub const BOOTSTRAP_ARENA_SIZE: u32 = 4 * 1024 * 1024;

/// Smallest address the heap window may start at.
pub const HEAP_WINDOW_FLOOR: u32 = STACK_SLOT_BASE + DIRECTORY_ENTRY_SPAN;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(STACK_SLOT_BASE.is_multiple_of(DIRECTORY_ENTRY_SPAN));
    assert!(PHYS_LOAD.is_multiple_of(PAGE_SIZE));
    assert!(BOOTSTRAP_ARENA_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(IDENTITY_LIMIT <= STACK_SLOT_BASE);
    assert!(HEAP_WINDOW_FLOOR > STACK_SLOT_PAGE);
};
