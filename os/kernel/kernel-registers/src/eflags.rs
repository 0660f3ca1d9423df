use bitfield_struct::bitfield;

/// EFLAGS as seen in 32-bit protected mode.
#[bitfield(u32)]
pub struct Eflags {
    /// Bit 0: Carry Flag.
    pub cf_carry: bool,

    /// Bit 1: always 1.
    #[bits(default = true)]
    pub always1: bool,

    /// Bits 2–8: PF, reserved, AF, reserved, ZF, SF, TF.
    #[bits(7)]
    pub arithmetic: u8,

    /// Bit 9: Interrupt Enable Flag.
    pub if_interrupt_enable: bool,

    /// Bit 10: Direction Flag.
    pub df_direction: bool,

    /// Bit 11: Overflow Flag.
    pub of_overflow: bool,

    /// Bits 12–13: I/O Privilege Level.
    #[bits(2)]
    pub iopl: u8,

    /// Bits 14–31: NT, RF, VM, AC, VIF, VIP, ID and reserved.
    #[bits(18)]
    pub system: u32,
}

impl Eflags {
    /// Current EFLAGS of the executing CPU.
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    #[must_use]
    pub fn read() -> Self {
        let flags: u32;
        unsafe {
            core::arch::asm!("pushfd; pop {}", out(reg) flags, options(nomem, preserves_flags));
        }
        Self::from_bits(flags)
    }

    /// Flags a fresh kernel task starts with. Interrupts stay masked until
    /// the task has released the scheduler lock it inherits.
    #[must_use]
    pub const fn initial_task() -> Self {
        Self::new()
    }
}
