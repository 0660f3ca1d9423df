mod common;

use common::{boot, work};
use core::time::Duration;
use kernel_tasking::{Latch, TaskId, TaskPriority, TaskState, Waitable, wait_all, wait_one};
use std::sync::Arc;

#[test]
fn waiter_on_a_background_finisher_runs_first() {
    let h = boot();
    let s = &h.scheduler;
    let idle = s.idle_task().unwrap();
    let a = s.spawn(work, TaskPriority::Normal).unwrap();
    let b = s.spawn(work, TaskPriority::Background).unwrap();

    s.current().suspend(s);
    assert_eq!(h.current(), a.id());
    h.reschedule();
    assert_eq!(h.current(), a.id(), "background never preempts");

    let latch = Arc::new(Latch::new(s));
    latch.wait(s);
    assert_eq!(a.state(), TaskState::Waiting);
    assert_eq!(a.waiting_on(), Some("latch"));
    assert_eq!(a.dynamic_priority(), 129);
    assert_eq!(latch.waiters(), [a.id()]);
    assert_eq!(h.current(), idle);

    // The idle task overruns its slice and hands over to B.
    s.timer_tick(Duration::from_millis(60));
    assert_eq!(h.current(), b.id());

    latch.finish(s);
    assert_eq!(a.state(), TaskState::Running);
    assert_eq!(a.waiting_on(), None);
    assert_eq!(b.state(), TaskState::Ready);
    assert!(latch.waiters().is_empty());
    assert_eq!(h.switches(), [a.id(), idle, b.id(), a.id()]);
}

#[test]
fn finish_wakes_every_waiter_in_order() {
    let h = boot();
    let s = &h.scheduler;
    let tasks: Vec<_> = (0..3)
        .map(|_| s.spawn(work, TaskPriority::Normal).unwrap())
        .collect();
    let ids: Vec<TaskId> = tasks.iter().map(|t| t.id()).collect();

    s.current().suspend(s);
    let latch = Latch::new(s);
    for _ in &tasks {
        latch.wait(s);
    }
    assert_eq!(latch.waiters(), ids);
    assert_eq!(h.current(), s.idle_task().unwrap());

    latch.finish(s);
    assert!(tasks.iter().all(|t| t.state() != TaskState::Waiting));
    assert_eq!(h.current(), ids[0]);
    assert_eq!(s.ready_count(), 3, "two waiters and the idle task");

    tasks[0].suspend(s);
    assert_eq!(h.current(), ids[1]);
    tasks[1].suspend(s);
    assert_eq!(h.current(), ids[2]);
}

#[test]
fn waiting_on_a_ready_latch_returns_at_once() {
    let h = boot();
    let s = &h.scheduler;
    let latch = Latch::new(s);
    latch.finish(s);
    latch.wait(s);

    let current = s.current();
    assert_eq!(current.id(), TaskId::BOOT);
    assert_eq!(current.state(), TaskState::Running);
    assert_eq!(current.dynamic_priority(), 128);
    assert!(h.switches().is_empty());
}

#[test]
#[should_panic(expected = "cannot wait on itself")]
fn waiting_on_oneself_is_fatal() {
    let h = boot();
    let me = h.scheduler.current();
    me.wait(&h.scheduler);
}

#[test]
fn waiting_for_a_task_to_end() {
    let h = boot();
    let s = &h.scheduler;
    let worker = s.spawn(work, TaskPriority::Normal).unwrap();

    worker.wait(s);
    assert_eq!(h.current(), worker.id());
    let boot_task = s.task(TaskId::BOOT).unwrap();
    assert_eq!(boot_task.waiting_on(), Some("task"));

    worker.end_failed(s);
    assert!(worker.is_ready());
    assert!(worker.is_failed());
    assert_eq!(h.switches(), [worker.id(), TaskId::BOOT]);
    assert_eq!(boot_task.state(), TaskState::Running);
}

#[test]
fn wait_all_releases_only_at_the_last_member() {
    let h = boot();
    let s = &h.scheduler;
    let first = Arc::new(Latch::new(s));
    let second = Arc::new(Latch::new(s));
    let both = wait_all(s, vec![
        Box::new(first.clone()) as Box<dyn Waitable>,
        Box::new(second.clone()) as Box<dyn Waitable>,
    ]);

    both.wait(s);
    let idle = s.idle_task().unwrap();
    assert_eq!(h.current(), idle);

    first.finish(s);
    assert_eq!(h.current(), idle);
    second.finish(s);
    assert!(both.is_ready());
    assert_eq!(h.current(), TaskId::BOOT);
    assert_eq!(h.switches(), [idle, TaskId::BOOT]);
}

#[test]
fn ended_waiters_are_skipped() {
    let h = boot();
    let s = &h.scheduler;
    let w = s.spawn(work, TaskPriority::Normal).unwrap();
    s.current().suspend(s);
    assert_eq!(h.current(), w.id());

    let latch = Latch::new(s);
    latch.wait(s);
    w.end(s);
    assert_eq!(w.state(), TaskState::Stopped);

    latch.finish(s);
    assert_eq!(w.state(), TaskState::Stopped);
    assert_eq!(s.ready_count(), 0);
    assert_eq!(h.current(), s.idle_task().unwrap());
}

#[test]
fn latch_and_combinator_accessors_mask_interrupts() {
    let h = boot();
    let s = &h.scheduler;
    let latch = Arc::new(Latch::new(s));
    let one = wait_one(s, vec![Box::new(latch.clone()) as Box<dyn Waitable>]);
    assert!(h.masks(|_| latch.is_ready()));
    assert!(h.masks(|_| latch.is_failed()));
    assert!(h.masks(|_| latch.waiters()));
    assert!(h.masks(|_| one.is_ready()));

    let before = h.disables();
    latch.finish(s);
    assert!(h.disables() > before);
    assert!(one.is_ready());
    assert!(s.platform().interrupts().interrupts_enabled());
}
