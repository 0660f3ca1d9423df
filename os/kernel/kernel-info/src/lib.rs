//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot interface shared by the memory
//! manager, the scheduler and the boot glue.
//!
//! ## Overview
//!
//! * [`memory`]: compile-time layout of the 32-bit address space (page size,
//!   table geometry, the per-task stack slot, the identity-mapping limit and the
//!   bootstrap arena), checked by `const` assertions.
//! * [`boot`]: the physical memory map and kernel image range handed over by
//!   the boot loader.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Identity-mapped physical RAM   │
//!             │  (available regions, kernel     │
//!             │   image read-only)              │
//! STACK_SLOT  ├─────────────────────────────────┤ 0xBFC0_0000
//!             │  Per-task private stack slot    │
//!             │  (one directory entry)          │
//!             ├─────────────────────────────────┤ 0xC000_0000
//!             │          unused                 │
//! heap window ├─────────────────────────────────┤ (1024 - heap tables) << 22
//!             │  Kernel heap window             │
//!             │  (frame i at window + i * 4096) │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
