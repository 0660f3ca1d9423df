use crate::MapError;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// The memory a task owns: its own page directory and one private stack page.
///
/// Produced by [`ThreadMemory::create_thread`] and handed back through
/// [`ThreadMemory::release_thread`] exactly once.
#[derive(Debug, Eq, PartialEq)]
pub struct ThreadData {
    /// The task's page directory.
    pub directory: PhysicalPage<Size4K>,
    /// The page table behind the private stack slot.
    pub stack_table: PhysicalPage<Size4K>,
    /// The frame backing the stack.
    pub stack_frame: PhysicalPage<Size4K>,
    /// Where the stack frame is mapped inside the task's directory.
    pub stack_page: VirtualPage<Size4K>,
}

impl ThreadData {
    /// Initial stack pointer; the stack grows down from the end of its page.
    #[inline]
    #[must_use]
    pub const fn stack_top(&self) -> VirtualAddress {
        VirtualAddress::new(self.stack_page.base().as_u32().wrapping_add(PAGE_SIZE))
    }
}

/// Creates and tears down per-task address spaces.
pub trait ThreadMemory: Send + Sync {
    /// Clones the kernel address space and gives it a private stack.
    ///
    /// # Errors
    /// Out of frames, or memory management not initialized.
    fn create_thread(&self) -> Result<ThreadData, MapError>;

    /// Frees everything [`create_thread`](Self::create_thread) allocated.
    fn release_thread(&self, data: ThreadData);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_top_is_end_of_page() {
        let data = ThreadData {
            directory: PhysicalPage::from_frame_number(1),
            stack_table: PhysicalPage::from_frame_number(2),
            stack_frame: PhysicalPage::from_frame_number(3),
            stack_page: VirtualPage::containing_address(VirtualAddress::new(0xBFFF_F000)),
        };
        assert_eq!(data.stack_top(), VirtualAddress::new(0xC000_0000));
    }
}
