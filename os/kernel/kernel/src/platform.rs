//! # Task Switching Platform
//!
//! [`KernelPlatform`] is what the scheduler switches tasks with: it lays out
//! the first stack frame of every task, keeps the memory manager's idea of
//! the current directory in step with CR3 and leaves the register work to a
//! [`Cpu`].
//!
//! ## Initial stack frame
//!
//! Every task stack sits at the same virtual address in its own directory,
//! so CR3 and ESP change in one step. A fresh stack is laid out so that
//! the first switch to it "returns" into the task entry glue, which finds
//! its two arguments where a cdecl caller would have left them:
//!
//! ```text
//!  stack top ─► ┌──────────────┐
//!               │ (alignment)  │ x2
//!               │ scheduler    │ ◄ 16-byte aligned
//!               │ entry        │
//!               │ 0            │  return address of the glue
//!               │ task glue    │  popped by `ret`
//!               │ ebp ebx      │
//!               │ esi edi      │
//!  stack ptr ─► │ eflags       │
//!               └──────────────┘
//! ```

use core::ptr;
use kernel_alloc::KernelMemory;
use kernel_memory_addresses::PhysicalAddress;
use kernel_registers::eflags::Eflags;
use kernel_sync::InterruptControl;
use kernel_tasking::{Platform, Scheduler, SwitchTarget, TaskEntry};
use kernel_vmem::{PagingHardware, PhysMapper, PhysMapperExt, ThreadData};

/// Number of 32-bit words in a fresh task's initial frame.
pub const INITIAL_FRAME_WORDS: usize = 11;

/// Raw processor operations below the scheduler.
pub trait Cpu: Send + Sync {
    fn interrupts(&self) -> &dyn InterruptControl;

    /// Pushes the callee-saved registers and the flags, stores the stack
    /// pointer through `save`, loads `directory` (if given), loads `next`
    /// as the stack pointer and pops the registers saved there.
    ///
    /// # Safety
    /// `next` must point at a frame saved by this method or built by
    /// [`KernelPlatform`], valid in `directory`. Interrupts are masked.
    unsafe fn switch_stacks(&self, save: *mut u32, next: u32, directory: Option<PhysicalAddress>);

    /// Address the initial frame of a new task returns into. The code there
    /// is entered like a cdecl `fn(entry, scheduler)`.
    fn task_entry(&self) -> u32;

    fn halt(&self);
}

/// The scheduler's [`Platform`]: kernel memory plus a [`Cpu`].
pub struct KernelPlatform<M: PhysMapper + 'static, H: PagingHardware + 'static, C: Cpu> {
    memory: &'static KernelMemory<M, H>,
    cpu: C,
}

impl<M: PhysMapper, H: PagingHardware, C: Cpu> KernelPlatform<M, H, C> {
    #[must_use]
    pub const fn new(memory: &'static KernelMemory<M, H>, cpu: C) -> Self {
        Self { memory, cpu }
    }

    #[must_use]
    pub const fn cpu(&self) -> &C {
        &self.cpu
    }

    /// The frame [`Platform::prepare_stack`] writes, lowest address first.
    #[must_use]
    pub fn initial_frame(&self, entry: TaskEntry, scheduler: &Scheduler) -> [u32; INITIAL_FRAME_WORDS] {
        [
            Eflags::initial_task().into_bits(),
            0, // edi
            0, // esi
            0, // ebx
            0, // ebp
            self.cpu.task_entry(),
            0,
            address_of(entry as *const ()),
            address_of(ptr::from_ref(scheduler).cast()),
            0,
            0,
        ]
    }
}

/// Pointers are 32 bits wide on the target; host tests only compare them.
#[allow(clippy::cast_possible_truncation)]
fn address_of(p: *const ()) -> u32 {
    p.addr() as u32
}

impl<M, H, C> Platform for KernelPlatform<M, H, C>
where
    M: PhysMapper + Send + 'static,
    H: PagingHardware + Send + 'static,
    C: Cpu,
{
    fn interrupts(&self) -> &dyn InterruptControl {
        self.cpu.interrupts()
    }

    fn prepare_stack(&self, thread: &ThreadData, entry: TaskEntry, scheduler: &Scheduler) -> u32 {
        let frame = self.initial_frame(entry, scheduler);
        let bytes = u32::try_from(size_of_val(&frame)).unwrap_or(u32::MAX);
        let offset = kernel_info::memory::PAGE_SIZE - bytes;

        // The stack frame is not mapped in the running directory; it is
        // written through its physical address.
        let written = self.memory.with_vmm(|vmm| {
            let page = vmm.mapper().frame_mut(thread.stack_frame);
            for (slot, word) in page[offset as usize..].chunks_exact_mut(4).zip(frame) {
                slot.copy_from_slice(&word.to_le_bytes());
            }
        });
        debug_assert!(written.is_some(), "task stack prepared before activation");

        log::trace!("initial frame for {} at {}", thread.stack_page, thread.stack_top());
        thread.stack_top().as_u32() - bytes
    }

    unsafe fn switch(&self, save: *mut u32, target: SwitchTarget) {
        let directory = target.directory.or_else(|| self.memory.kernel_directory());
        if let Some(directory) = directory {
            self.memory.assume_loaded(directory);
        }
        unsafe {
            self.cpu
                .switch_stacks(save, target.stack_pointer, directory.map(|d| d.base()));
        }
    }

    fn halt(&self) {
        self.cpu.halt();
    }
}
