//! # Kernel
//!
//! Brings the memory manager and the scheduler up in the right order and
//! wires them to the interrupts that drive them.
//!
//! ```text
//!  boot glue ──► Kernel::boot
//!                  ├─ logger (debug console)
//!                  ├─ bootstrap arena           kernel_alloc::KernelMemory
//!                  ├─ vector 14 → page fault report
//!                  ├─ paging + heap             (identity map, heap window)
//!                  ├─ task zero + idle task     kernel_tasking::Scheduler
//!                  └─ vector 32 → timer_tick    (IRQ 0, 50 Hz by default)
//! ```
//!
//! The descriptor tables, the interrupt entry stubs, the timer divisor and the
//! parsing of the boot loader's memory map happen before [`Kernel::boot`] and
//! are not part of this crate.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod config;
pub mod interrupts;
pub mod page_fault;
mod platform;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod ports;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

pub use config::KernelConfig;
pub use interrupts::{
    HandlerTable, InterruptContext, InterruptHandler, InterruptRegistry, PAGE_FAULT_VECTOR,
    TIMER_VECTOR, TrapFrame,
};
pub use page_fault::{PageFaultError, PageFaultReport};
pub use platform::{Cpu, INITIAL_FRAME_WORDS, KernelPlatform};

use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_alloc::{BootstrapAlloc, KernelMemory, VmmError};
use kernel_info::boot::BootInfo;
use kernel_qemu::QemuLogger;
use kernel_tasking::{Scheduler, SpawnError};
use kernel_vmem::{PagingHardware, PhysMapper};
use log::LevelFilter;

static LOGGER: QemuLogger = QemuLogger::new();

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("memory management failed to start: {0}")]
    Memory(#[from] VmmError),
    #[error("the scheduler failed to start: {0}")]
    Scheduler(#[from] SpawnError),
}

/// The running kernel: its memory manager and its scheduler.
pub struct Kernel<M: PhysMapper + 'static, H: PagingHardware + 'static> {
    memory: &'static KernelMemory<M, H>,
    scheduler: Arc<Scheduler>,
    config: KernelConfig,
}

impl<M, H> Kernel<M, H>
where
    M: PhysMapper + Send + 'static,
    H: PagingHardware + Clone + Send + Sync + 'static,
{
    /// Turns on paging and the heap, wraps the running code as task zero and
    /// starts the idle task. Page faults are reported from the moment the
    /// bootstrap arena exists; timer ticks reach the scheduler once it runs.
    ///
    /// # Errors
    /// Not enough memory to build the kernel directory or the idle task.
    pub fn boot<C: Cpu + 'static>(
        boot_info: BootInfo<'_>,
        memory: &'static KernelMemory<M, H>,
        mapper: M,
        hw: H,
        cpu: C,
        interrupts: &dyn InterruptRegistry,
        config: KernelConfig,
    ) -> Result<Self, BootError> {
        init_logging(config.log_level);
        log::info!(
            "booting: {} memory regions, kernel image {}..{}",
            boot_info.memory_map.len(),
            boot_info.kernel_image.start,
            boot_info.kernel_image.end
        );

        // Handlers are boxed, so the arena must exist before anything is registered.
        memory.init_bootstrap(BootstrapAlloc::for_boot(boot_info));
        interrupts.register(PAGE_FAULT_VECTOR, page_fault_handler(hw.clone()));

        memory.activate(boot_info, mapper, hw)?;
        let platform = KernelPlatform::new(memory, cpu);
        let scheduler = Scheduler::init(Box::new(platform), memory, config.scheduler, idle)?;

        let period = config.tick_period();
        let ticker = scheduler.clone();
        interrupts.register(
            TIMER_VECTOR,
            Box::new(move |_| ticker.timer_tick(period)),
        );

        log::info!(
            "kernel up: {} KiB heap, {} Hz timer",
            memory.heap_size() / 1024,
            config.timer_frequency
        );
        Ok(Self {
            memory,
            scheduler,
            config,
        })
    }
}

impl<M: PhysMapper + 'static, H: PagingHardware + 'static> Kernel<M, H> {
    #[must_use]
    pub const fn memory(&self) -> &'static KernelMemory<M, H> {
        self.memory
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }
}

fn page_fault_handler<H: PagingHardware + Send + Sync + 'static>(hw: H) -> InterruptHandler {
    Box::new(move |ctx| page_fault::handle(ctx, hw.fault_address()))
}

/// Body of the idle task: sleep until the next interrupt, forever.
fn idle(scheduler: &Scheduler) {
    loop {
        scheduler.platform().halt();
    }
}

fn init_logging(level: LevelFilter) {
    if LOGGER.init(level).is_err() {
        // Installed by an earlier boot; only the level changes.
        log::set_max_level(level);
    }
}
