//! # Kernel Tasking
//!
//! Tasks, the priority scheduler and the primitives tasks block on.
//!
//! ```text
//!   spawn ──► Ready ──schedule()──► Running ──end()──► Stopped
//!               ▲                     │
//!               └──finish()── Waiting ◄┘ wait()
//! ```
//!
//! - [`Scheduler`]: four static tiers (Critical, RealTime, Normal, Background),
//!   each ordered by a dynamic priority that rises while a task waits and
//!   drops when it overruns its time slice.
//! - [`Task`]: a flow of control with its own address space, obtained through
//!   [`ThreadMemory`](kernel_vmem::ThreadMemory).
//! - [`Latch`], [`WaitAll`], [`WaitOne`]: one-shot [`Waitable`]s.
//!
//! The CPU is reached through the [`Platform`] trait; the scheduler itself is
//! plain data and runs unchanged in host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod platform;
mod queue;
pub mod scheduler;
pub mod task;
pub mod waitable;

pub use platform::{Platform, SwitchTarget};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerLock, StuffLock};
pub use task::{Task, TaskEntry, TaskId, TaskPriority, TaskState};
pub use waitable::{Latch, Subscriber, WaitAll, WaitOne, Waitable, wait_all, wait_one};

use kernel_vmem::MapError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SpawnError {
    #[error("no memory for the task's address space: {0}")]
    AddressSpace(#[from] MapError),
}
