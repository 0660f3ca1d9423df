//! Ready queues: one max-heap per static tier, keyed on dynamic priority with
//! FIFO order among equals.

use crate::task::{Task, TaskId, TaskPriority};
use alloc::collections::BinaryHeap;
use alloc::sync::Arc;
use core::cmp::Ordering;

struct Entry {
    priority: u8,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier enqueue wins among equal priorities.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub struct ReadyQueues {
    tiers: [BinaryHeap<Entry>; 4],
    seq: u64,
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Arc<Task>) {
        self.seq += 1;
        log::trace!(
            "ready: task {} ({:?}, {})",
            task.id(),
            task.priority(),
            task.dynamic_priority()
        );
        self.tiers[task.priority().tier()].push(Entry {
            priority: task.dynamic_priority(),
            seq: self.seq,
            task,
        });
    }

    /// Most urgent task, without removing it.
    pub fn peek(&self) -> Option<&Arc<Task>> {
        self.tiers.iter().find_map(|t| t.peek()).map(|e| &e.task)
    }

    pub fn pop(&mut self) -> Option<Arc<Task>> {
        self.tiers
            .iter_mut()
            .find_map(BinaryHeap::pop)
            .map(|e| e.task)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Arc<Task>> {
        let tier = self
            .tiers
            .iter_mut()
            .find(|t| t.iter().any(|e| e.task.id() == id))?;
        let mut found = None;
        tier.retain(|e| {
            if e.task.id() == id {
                found = Some(e.task.clone());
                false
            } else {
                true
            }
        });
        found
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tiers.iter().flatten().any(|e| e.task.id() == id)
    }

    /// Raises the dynamic priority of every queued task by `step`.
    pub fn age(&mut self, step: u8) {
        for tier in &mut self.tiers {
            let mut entries = core::mem::take(tier).into_vec();
            for e in &mut entries {
                e.task.raise_dynamic_priority(step);
                e.priority = e.task.dynamic_priority();
            }
            *tier = BinaryHeap::from(entries);
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(BinaryHeap::len).sum()
    }

    pub fn tier_len(&self, priority: TaskPriority) -> usize {
        self.tiers[priority.tier()].len()
    }
}
