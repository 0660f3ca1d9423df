mod common;

use common::{boot, boot_with, work};
use core::time::Duration;
use kernel_tasking::{SchedulerConfig, SpawnError, Task, TaskId, TaskPriority, TaskState, Waitable};

#[test]
fn init_wraps_the_boot_flow() {
    let h = boot();
    let current = h.scheduler.current();
    assert_eq!(current.id(), TaskId::BOOT);
    assert_eq!(current.state(), TaskState::Running);
    assert_eq!(current.directory(), None);

    let idle = h.scheduler.idle_task().unwrap();
    let idle = h.scheduler.task(idle).unwrap();
    assert_eq!(idle.priority(), TaskPriority::Background);
    assert_eq!(idle.state(), TaskState::Ready);
    assert!(idle.directory().is_some());

    assert_eq!(h.scheduler.task_count(), 2);
    assert_eq!(h.scheduler.ready_count(), 1);
    assert_eq!(h.scheduler.ready_in(TaskPriority::Background), 1);
    assert_eq!(h.scheduler.ready_in(TaskPriority::Normal), 0);
    assert!(h.switches().is_empty());
}

#[test]
#[should_panic(expected = "requires the scheduler lock")]
fn schedule_without_the_lock_is_fatal() {
    let h = boot();
    h.scheduler.schedule();
}

#[test]
fn tiers_run_in_order() {
    let h = boot();
    let s = &h.scheduler;
    let background = s.spawn(work, TaskPriority::Background).unwrap();
    let normal = s.spawn(work, TaskPriority::Normal).unwrap();
    let realtime = s.spawn(work, TaskPriority::RealTime).unwrap();
    let critical = Task::start(s, work, TaskPriority::Critical).unwrap();

    h.reschedule();
    assert_eq!(h.current(), critical.id());

    critical.suspend(s);
    assert_eq!(h.current(), realtime.id());
    realtime.suspend(s);
    // The preempted boot task was queued after `normal`.
    assert_eq!(h.current(), normal.id());
    normal.suspend(s);
    assert_eq!(h.current(), TaskId::BOOT);
    s.current().suspend(s);
    let idle = s.idle_task().unwrap();
    assert_eq!(h.current(), idle);

    assert_eq!(
        h.switches(),
        [critical.id(), realtime.id(), normal.id(), TaskId::BOOT, idle]
    );
    assert_eq!(background.state(), TaskState::Ready);
}

#[test]
fn background_never_preempts() {
    let h = boot();
    let b = h.scheduler.spawn(work, TaskPriority::Background).unwrap();
    for _ in 0..5 {
        h.scheduler.timer_tick(Duration::from_millis(1));
    }
    assert!(b.dynamic_priority() > h.scheduler.current().dynamic_priority());
    h.reschedule();
    assert_eq!(h.current(), TaskId::BOOT);
    assert!(h.switches().is_empty());
}

#[test]
fn equal_peers_do_not_preempt() {
    let h = boot();
    let n = h.scheduler.spawn(work, TaskPriority::Normal).unwrap();
    h.reschedule();
    assert_eq!(h.current(), TaskId::BOOT);
    assert_eq!(n.state(), TaskState::Ready);
}

#[test]
fn overrunning_the_slice_yields_to_peers() {
    let h = boot();
    let s = &h.scheduler;
    let n = s.spawn(work, TaskPriority::Normal).unwrap();

    s.timer_tick(Duration::from_millis(20));
    s.timer_tick(Duration::from_millis(20));
    assert!(h.switches().is_empty());

    s.timer_tick(Duration::from_millis(20));
    assert_eq!(h.switches(), [n.id()]);
    assert_eq!(s.since_boot(), Duration::from_millis(60));

    let boot_task = s.task(TaskId::BOOT).unwrap();
    assert_eq!(boot_task.state(), TaskState::Ready);
    assert_eq!(boot_task.dynamic_priority(), 127);
    assert_eq!(n.dynamic_priority(), 131);
    assert_eq!(n.state(), TaskState::Running);
}

#[test]
fn critical_tasks_keep_the_cpu_and_waiters_age() {
    let config = SchedulerConfig {
        boot_priority: TaskPriority::Critical,
        ..SchedulerConfig::default()
    };
    let h = boot_with(config, 64);
    let n = h.scheduler.spawn(work, TaskPriority::Normal).unwrap();

    let mut last = n.dynamic_priority();
    for _ in 0..300 {
        h.scheduler.timer_tick(Duration::from_millis(20));
        let now = n.dynamic_priority();
        assert!(now >= last, "aging never lowers a waiting task");
        last = now;
    }
    assert_eq!(last, 255);
    assert!(h.switches().is_empty());
    assert_eq!(h.current(), TaskId::BOOT);
}

#[test]
fn switches_under_lock_stuff_are_replayed_once() {
    let h = boot();
    let s = &h.scheduler;
    let c = s.spawn(work, TaskPriority::Critical).unwrap();
    {
        let _outer = s.lock_stuff();
        {
            let _inner = s.lock_stuff();
            s.schedule();
            s.schedule();
        }
        assert!(h.switches().is_empty());
        assert!(s.switch_postponed());
    }
    assert_eq!(h.switches(), [c.id()]);
    assert!(!s.switch_postponed());
    assert!(!s.is_locked());
}

#[test]
fn suspend_and_resume() {
    let h = boot();
    let s = &h.scheduler;
    let n = s.spawn(work, TaskPriority::Normal).unwrap();

    n.suspend(s);
    assert!(n.is_suspended());
    assert_eq!(n.state(), TaskState::Waiting);
    assert_eq!(s.ready_count(), 1);

    n.resume(s);
    assert_eq!(n.state(), TaskState::Ready);
    assert_eq!(s.ready_count(), 2);
    assert!(h.switches().is_empty(), "equal priority does not preempt");

    let r = s.spawn(work, TaskPriority::RealTime).unwrap();
    r.suspend(s);
    r.resume(s);
    assert_eq!(h.switches(), [r.id()]);
}

#[test]
fn ended_tasks_are_released_after_the_next_decision() {
    let h = boot();
    let s = &h.scheduler;
    let c = s.spawn(work, TaskPriority::Critical).unwrap();
    let directory = c.directory().unwrap();
    h.reschedule();
    assert_eq!(h.current(), c.id());

    c.end(s);
    assert_eq!(c.state(), TaskState::Stopped);
    assert!(c.completion().is_ready());
    assert_eq!(h.current(), TaskId::BOOT);
    assert_eq!(s.task_count(), 2);

    h.reschedule();
    assert!(h.memory.released().is_empty(), "still referenced here");
    drop(c);
    assert_eq!(h.memory.released(), [directory]);
}

#[test]
fn exit_current_ends_the_running_task() {
    let h = boot();
    let s = &h.scheduler;
    let c = s.spawn(work, TaskPriority::Critical).unwrap();
    h.reschedule();
    s.exit_current();
    assert_eq!(c.state(), TaskState::Stopped);
    assert_eq!(h.switches(), [c.id(), TaskId::BOOT]);
    assert!(!s.is_locked());
}

#[test]
fn spawn_fails_without_memory() {
    let h = boot_with(SchedulerConfig::default(), 1);
    let err = h.scheduler.spawn(work, TaskPriority::Normal).unwrap_err();
    assert!(matches!(err, SpawnError::AddressSpace(_)));
    assert_eq!(h.scheduler.task_count(), 2);
    assert_eq!(h.memory.live(), 1);
}

#[test]
#[should_panic(expected = "no runnable task")]
fn running_out_of_tasks_is_fatal() {
    let h = boot();
    let s = &h.scheduler;
    let idle = s.task(s.idle_task().unwrap()).unwrap();
    idle.suspend(s);
    s.current().suspend(s);
}

#[test]
fn a_started_task_drops_the_inherited_lock() {
    let h = boot();
    let s = &h.scheduler;
    core::mem::forget(s.lock_scheduler());
    assert!(s.is_locked());
    assert!(!s.platform().interrupts().interrupts_enabled());

    s.task_started();
    assert!(!s.is_locked());
    assert!(s.platform().interrupts().interrupts_enabled());
}

#[test]
fn run_state_accessors_mask_interrupts() {
    let h = boot();
    let idle = h.scheduler.idle_task().unwrap();
    assert!(h.masks(|s| s.current()));
    assert!(h.masks(|s| s.since_boot()));
    assert!(h.masks(|s| s.task_count()));
    assert!(h.masks(|s| s.ready_count()));
    assert!(h.masks(|s| s.ready_in(TaskPriority::Normal)));
    assert!(h.masks(|s| s.task(idle)));
    assert!(h.masks(|s| s.idle_task()));
}

#[test]
fn task_accessors_mask_interrupts() {
    let h = boot();
    let worker = h.scheduler.spawn(work, TaskPriority::Normal).unwrap();
    let boot_task = h.scheduler.task(TaskId::BOOT).unwrap();
    for task in [&worker, &boot_task] {
        assert!(h.masks(|_| task.state()));
        assert!(h.masks(|_| task.waiting_on()));
        assert!(h.masks(|_| task.is_suspended()));
        assert!(h.masks(|_| task.is_blocked()));
        assert!(h.masks(|_| task.is_ready()));
    }
}

#[test]
fn accessors_under_the_scheduler_lock_keep_interrupts_masked() {
    let h = boot();
    let s = &h.scheduler;
    let _lock = s.lock_scheduler();
    let _ = s.current().state();
    let _ = s.ready_count();
    assert!(!s.platform().interrupts().interrupts_enabled());
}
