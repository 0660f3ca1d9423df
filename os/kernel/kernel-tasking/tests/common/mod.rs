//! Host stand-ins for the CPU and the memory manager.

#![allow(dead_code)]

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_sync::InterruptControl;
use kernel_tasking::{Platform, Scheduler, SchedulerConfig, SwitchTarget, TaskEntry, TaskId};
use kernel_vmem::{FrameAllocError, MapError, ThreadData, ThreadMemory};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Interrupt flag that counts how often it was masked.
#[derive(Debug)]
pub struct HostIrq {
    enabled: AtomicBool,
    disables: Arc<AtomicUsize>,
}

impl InterruptControl for HostIrq {
    fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.disables.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }
}

/// Records every switch instead of performing it.
pub struct RecordingPlatform {
    irq: HostIrq,
    switches: Arc<Mutex<Vec<TaskId>>>,
}

impl Platform for RecordingPlatform {
    fn interrupts(&self) -> &dyn InterruptControl {
        &self.irq
    }

    fn prepare_stack(&self, thread: &ThreadData, _entry: TaskEntry, _scheduler: &Scheduler) -> u32 {
        thread.stack_top().as_u32() - 32
    }

    unsafe fn switch(&self, save: *mut u32, target: SwitchTarget) {
        assert!(!self.irq.interrupts_enabled(), "switch with interrupts enabled");
        unsafe { save.write(0xC0DE_0000) };
        self.switches.lock().unwrap().push(target.task);
    }

    fn halt(&self) {}
}

/// Hands out made-up address spaces and remembers which came back.
pub struct FakeMemory {
    next_frame: AtomicU32,
    limit: usize,
    live: Mutex<usize>,
    released: Mutex<Vec<PhysicalPage<Size4K>>>,
}

impl FakeMemory {
    pub fn released(&self) -> Vec<PhysicalPage<Size4K>> {
        self.released.lock().unwrap().clone()
    }

    pub fn live(&self) -> usize {
        *self.live.lock().unwrap()
    }
}

impl ThreadMemory for FakeMemory {
    fn create_thread(&self) -> Result<ThreadData, MapError> {
        let mut live = self.live.lock().unwrap();
        if *live >= self.limit {
            return Err(MapError::OutOfMemory(FrameAllocError::OutOfMemory));
        }
        *live += 1;
        let n = self.next_frame.fetch_add(3, Ordering::SeqCst);
        Ok(ThreadData {
            directory: PhysicalPage::from_frame_number(n),
            stack_table: PhysicalPage::from_frame_number(n + 1),
            stack_frame: PhysicalPage::from_frame_number(n + 2),
            stack_page: VirtualPage::containing_address(VirtualAddress::new(0xBFFF_F000)),
        })
    }

    fn release_thread(&self, data: ThreadData) {
        *self.live.lock().unwrap() -= 1;
        self.released.lock().unwrap().push(data.directory);
    }
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub memory: &'static FakeMemory,
    switches: Arc<Mutex<Vec<TaskId>>>,
    disables: Arc<AtomicUsize>,
}

impl Harness {
    /// How often interrupts were masked so far.
    pub fn disables(&self) -> usize {
        self.disables.load(Ordering::SeqCst)
    }

    /// Whether `f` masked interrupts, and left them enabled afterwards.
    pub fn masks<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> bool {
        let before = self.disables();
        f(&self.scheduler);
        self.disables() > before && self.scheduler.platform().interrupts().interrupts_enabled()
    }

    /// Every task switched to so far, oldest first.
    pub fn switches(&self) -> Vec<TaskId> {
        self.switches.lock().unwrap().clone()
    }

    pub fn current(&self) -> TaskId {
        self.scheduler.current().id()
    }

    /// Runs one scheduling decision the way interrupt code would.
    pub fn reschedule(&self) {
        let _lock = self.scheduler.lock_scheduler();
        self.scheduler.schedule();
    }
}

pub fn idle(scheduler: &Scheduler) {
    scheduler.platform().halt();
}

pub fn work(_scheduler: &Scheduler) {}

pub fn boot() -> Harness {
    boot_with(SchedulerConfig::default(), 64)
}

pub fn boot_with(config: SchedulerConfig, thread_limit: usize) -> Harness {
    let switches = Arc::new(Mutex::new(Vec::new()));
    let disables = Arc::new(AtomicUsize::new(0));
    let platform = RecordingPlatform {
        irq: HostIrq {
            enabled: AtomicBool::new(true),
            disables: disables.clone(),
        },
        switches: switches.clone(),
    };
    let memory: &'static FakeMemory = Box::leak(Box::new(FakeMemory {
        next_frame: AtomicU32::new(0x100),
        limit: thread_limit,
        live: Mutex::new(0),
        released: Mutex::new(Vec::new()),
    }));
    let scheduler = Scheduler::init(Box::new(platform), memory, config, idle).expect("scheduler boots");
    Harness {
        scheduler,
        memory,
        switches,
        disables,
    }
}
