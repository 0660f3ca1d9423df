//! # IA-32 Glue
//!
//! The pieces that only exist on the real machine: the global allocator, the
//! stack switch, the entry of new tasks, the common interrupt dispatcher and
//! the panic handler.

use crate::interrupts::{HandlerTable, IRQ_BASE, InterruptContext, TrapFrame};
use crate::platform::Cpu;
use crate::ports::{PIC_EOI, PIC1_COMMAND, PIC2_COMMAND, outb};
use crate::{BootError, Kernel, KernelConfig};
use core::arch::{asm, naked_asm};
use kernel_alloc::KernelMemory;
use kernel_info::boot::BootInfo;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{InterruptControl, X86Interrupts};
use kernel_tasking::{Scheduler, TaskEntry};
use kernel_vmem::{IdentityMapper, X86Paging};

/// Every allocation of the kernel goes through here.
#[cfg_attr(not(test), global_allocator)]
pub static MEMORY: KernelMemory<IdentityMapper, X86Paging> = KernelMemory::new(&X86Interrupts);

/// Handlers the interrupt entry stubs dispatch to.
pub static HANDLERS: HandlerTable = HandlerTable::new(&X86Interrupts);

pub type X86Kernel = Kernel<IdentityMapper, X86Paging>;

/// Boots on the executing CPU. Called once by the boot loader glue with
/// interrupts masked and the descriptor tables loaded.
///
/// # Errors
/// See [`Kernel::boot`].
pub fn boot(boot_info: BootInfo<'_>, config: KernelConfig) -> Result<X86Kernel, BootError> {
    Kernel::boot(
        boot_info,
        &MEMORY,
        IdentityMapper,
        X86Paging,
        X86Cpu,
        &HANDLERS,
        config,
    )
    .inspect_err(|e| log::error!("boot failed: {e}"))
}

/// The executing processor.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Cpu;

impl Cpu for X86Cpu {
    fn interrupts(&self) -> &dyn InterruptControl {
        &X86Interrupts
    }

    unsafe fn switch_stacks(&self, save: *mut u32, next: u32, directory: Option<PhysicalAddress>) {
        let directory = directory.map_or(0, PhysicalAddress::as_u32);
        unsafe { switch_stacks(save, next, directory) }
    }

    fn task_entry(&self) -> u32 {
        u32::try_from(task_main as usize).unwrap_or_default()
    }

    fn halt(&self) {
        unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) }
    }
}

/// `switch_stacks(save, next, directory)`, cdecl. A zero `directory` keeps
/// CR3. Nothing touches the stack between the CR3 load and the ESP load:
/// both stacks live at the same virtual address.
#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(save: *mut u32, next: u32, directory: u32) {
    naked_asm!(
        "mov eax, [esp + 4]",
        "mov edx, [esp + 8]",
        "mov ecx, [esp + 12]",
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        "pushfd",
        "mov [eax], esp",
        "test ecx, ecx",
        "jz 2f",
        "mov eax, cr3",
        "cmp eax, ecx",
        "je 2f",
        "mov cr3, ecx",
        "2:",
        "mov esp, edx",
        "popfd",
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        "ret",
    )
}

/// Where the initial frame of every task returns to.
extern "C" fn task_main(entry: *const (), scheduler: *const Scheduler) -> ! {
    // Safety: both words were written by `KernelPlatform::prepare_stack`
    // from a `TaskEntry` and the scheduler that outlives every task.
    let (entry, scheduler) = unsafe {
        (
            core::mem::transmute::<*const (), TaskEntry>(entry),
            &*scheduler,
        )
    };
    scheduler.task_started();
    entry(scheduler);
    scheduler.exit_current();

    log::error!("ended task resumed");
    loop {
        X86Cpu.halt();
    }
}

/// Called by every interrupt entry stub with the registers it pushed.
#[unsafe(no_mangle)]
extern "C" fn isr_dispatch(frame: &TrapFrame) {
    let ctx = InterruptContext::from(frame);
    if (IRQ_BASE..IRQ_BASE + 16).contains(&ctx.vector) {
        // Acknowledge first: the handler may switch tasks and return late.
        unsafe {
            if ctx.vector >= IRQ_BASE + 8 {
                outb(PIC2_COMMAND, PIC_EOI);
            }
            outb(PIC1_COMMAND, PIC_EOI);
        }
    }
    HANDLERS.dispatch(&ctx);
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    X86Interrupts.disable_interrupts();
    kernel_qemu::debugcon!("kernel panic: {info}\n");
    loop {
        X86Cpu.halt();
    }
}
