use crate::scheduler::Scheduler;
use crate::task::{TaskEntry, TaskId};
use alloc::sync::Arc;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_sync::{InterruptControl, IrqSpinLockGuard, SpinLock};
use kernel_vmem::ThreadData;

/// Where a context switch resumes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SwitchTarget {
    pub task: TaskId,
    /// Stack pointer saved when the task was switched out (or prepared by
    /// [`Platform::prepare_stack`]).
    pub stack_pointer: u32,
    /// Directory to load; `None` means the kernel directory.
    pub directory: Option<PhysicalPage<Size4K>>,
}

/// The CPU below the scheduler.
pub trait Platform: Send + Sync {
    /// The interrupt flag the scheduler lock masks.
    fn interrupts(&self) -> &dyn InterruptControl;

    /// Builds the initial frame on a new task's stack so that the first switch
    /// to it calls `entry(scheduler)`. Returns the stack pointer to resume it
    /// with.
    fn prepare_stack(&self, thread: &ThreadData, entry: TaskEntry, scheduler: &Scheduler) -> u32;

    /// Saves the running context, storing its stack pointer through `save`,
    /// then loads the target's directory and resumes it. Returns when the
    /// saved context is switched back to.
    ///
    /// # Safety
    /// `save` must stay valid until the saved context is resumed, and `target`
    /// must describe a context saved by this method or prepared by
    /// [`prepare_stack`](Self::prepare_stack). Interrupts are disabled.
    unsafe fn switch(&self, save: *mut u32, target: SwitchTarget);

    /// Waits for the next interrupt.
    fn halt(&self);
}

/// How tasks and latches mask interrupts around their locks: through the
/// platform of the scheduler they belong to.
#[derive(Clone)]
pub(crate) struct Masking(Option<Arc<dyn Platform>>);

impl Masking {
    /// For objects no interrupt handler can reach.
    pub(crate) const DETACHED: Self = Self(None);

    pub(crate) fn new(platform: Arc<dyn Platform>) -> Self {
        Self(Some(platform))
    }

    pub(crate) fn lock<'a, T>(
        &'a self,
        lock: &'a SpinLock<T>,
    ) -> IrqSpinLockGuard<'a, T, dyn InterruptControl + 'a> {
        let ctl: &dyn InterruptControl = match &self.0 {
            Some(platform) => platform.interrupts(),
            None => &Unmaskable,
        };
        lock.lock_irq(ctl)
    }
}

struct Unmaskable;

impl InterruptControl for Unmaskable {
    fn interrupts_enabled(&self) -> bool {
        false
    }

    fn disable_interrupts(&self) {}

    fn enable_interrupts(&self) {}
}
