//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Everything between the boot memory map and `alloc::boxed::Box`:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 KernelMemory                        │
//! │    • global allocator, interrupt-safe facade        │
//! │    • bootstrap arena until activation               │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           PageHeap / Virtual Memory Manager         │
//! │    • page-granular heap in a window at the top      │
//! │    • kernel directory, per-task clones, switching   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • one bit per 4 KiB frame of the heap region     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`bootstrap`]: bump allocator over the memory right behind the kernel
//!   image; serves the frame bitmap and the boot page tables.
//! - [`frame_alloc`]: the frame bitmap and the allocator built on it.
//! - [`vmm`]: builds the kernel directory, enables paging and manages task
//!   address spaces.
//! - [`heap`]: whole-page allocations with an in-band header.
//! - [`memory`]: the facade tying it together, usable as `#[global_allocator]`.
//!
//! Hardware access goes through the [`PhysMapper`](kernel_vmem::PhysMapper) and
//! [`PagingHardware`](kernel_vmem::PagingHardware) traits, so every layer runs
//! on the host in tests against simulated physical memory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod bootstrap;
pub mod frame_alloc;
pub mod heap;
pub mod memory;
pub mod vmm;

#[cfg(test)]
mod testing;

pub use bootstrap::{BootstrapAlloc, BootstrapError};
pub use frame_alloc::{BitmapFrameAlloc, FrameBitmap};
pub use heap::{HEAP_MAGIC, HeapError, PageHeap};
pub use memory::KernelMemory;
pub use vmm::{HeapWindow, Vmm, VmmError};
