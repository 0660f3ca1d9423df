//! # Interrupt Registration
//!
//! The descriptor tables and the assembly entry stubs live outside this
//! crate. Each stub pushes a [`TrapFrame`] and hands it to a
//! [`HandlerTable`], which calls the handler registered for the vector.
//!
//! ```text
//!   CPU ──► stub (pusha, vector, error code) ──► HandlerTable::dispatch
//!                                                   │
//!                       vector 14 ──► page fault report, halt
//!                       vector 32 ──► Scheduler::timer_tick
//! ```

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{InterruptControl, IrqSpinLockGuard, SpinLock};

/// Page fault exception (`#PF`).
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Vector of IRQ line 0 after the interrupt controller has been remapped
/// past the CPU exceptions.
pub const IRQ_BASE: u8 = 32;

/// IRQ line of the interval timer.
pub const TIMER_IRQ: u8 = 0;

pub const TIMER_VECTOR: u8 = IRQ_BASE + TIMER_IRQ;

/// Registers as pushed by the entry stubs, lowest address first.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct TrapFrame {
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    /// Pushed by the CPU for some exceptions, a zero placeholder otherwise.
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

const _: () = assert!(size_of::<TrapFrame>() == 14 * 4);

/// What a handler learns about the interrupt it serves.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InterruptContext {
    pub vector: u8,
    pub error_code: u32,
    /// Where the interrupted code resumes.
    pub instruction_pointer: VirtualAddress,
}

impl From<&TrapFrame> for InterruptContext {
    fn from(frame: &TrapFrame) -> Self {
        Self {
            vector: u8::try_from(frame.vector).unwrap_or(u8::MAX),
            error_code: frame.error_code,
            instruction_pointer: VirtualAddress::new(frame.eip),
        }
    }
}

pub type InterruptHandler = Box<dyn Fn(&InterruptContext) + Send + Sync>;

/// Installs handlers for interrupt vectors.
pub trait InterruptRegistry {
    /// Routes `vector` to `handler`, replacing any earlier handler.
    fn register(&self, vector: u8, handler: InterruptHandler);
}

type SharedHandler = Arc<dyn Fn(&InterruptContext) + Send + Sync>;

type Handlers = BTreeMap<u8, SharedHandler>;

/// Vector to handler map the entry stubs dispatch through. The map is locked
/// with interrupts masked.
pub struct HandlerTable {
    irq: &'static (dyn InterruptControl + Sync),
    handlers: SpinLock<Handlers>,
}

impl HandlerTable {
    #[must_use]
    pub const fn new(irq: &'static (dyn InterruptControl + Sync)) -> Self {
        Self {
            irq,
            handlers: SpinLock::new(BTreeMap::new()),
        }
    }

    fn handlers(&self) -> IrqSpinLockGuard<'_, Handlers, dyn InterruptControl + Sync> {
        self.handlers.lock_irq(self.irq)
    }

    #[must_use]
    pub fn is_registered(&self, vector: u8) -> bool {
        self.handlers().contains_key(&vector)
    }

    /// Calls the handler for `ctx.vector`. Returns `false` if there is none.
    ///
    /// The table is not locked while the handler runs; a handler may switch
    /// tasks and only return much later.
    pub fn dispatch(&self, ctx: &InterruptContext) -> bool {
        let handler = self.handlers().get(&ctx.vector).cloned();
        let Some(handler) = handler else {
            log::warn!("unhandled interrupt {}", ctx.vector);
            return false;
        };
        handler(ctx);
        true
    }
}

impl InterruptRegistry for HandlerTable {
    fn register(&self, vector: u8, handler: InterruptHandler) {
        if self.handlers().insert(vector, Arc::from(handler)).is_some() {
            log::warn!("handler for vector {vector} replaced");
        } else {
            log::debug!("handler for vector {vector} installed");
        }
    }
}
