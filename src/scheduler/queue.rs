//! Queue types for the scheduler

use crate::core::task::{Priority, TaskId};
use serde::Serialize;
use std::cmp::Ordering;

/// A task waiting for admission
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub priority: Priority,
    /// Monotonic submission sequence, breaks ties within a priority tier
    pub seq: u64,
    pub id: TaskId,
}

impl Eq for QueueEntry {}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: lower priority value, then earlier seq, sorts greatest
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_admitted: u64,
    /// Entries popped for tasks that were no longer pending
    pub total_skipped: u64,
    pub peak_queue_depth: usize,
}
