//! Task registry: the canonical set of tasks and their lifecycle transitions.
//!
//! Every state change goes through here under a single lock, and its event is
//! queued before the lock is released so observers see transitions in the
//! order they happened. A RUNNING task owns a [`RunSlot`] holding its
//! concurrency permit; the permit is dropped the moment the task leaves
//! RUNNING, whether by completion, pause or cancel.
//!
//! Pause and cancel only signal an execution. Until that execution returns it
//! stays in flight, and the task cannot be admitted again.

use crate::core::events::EventBus;
use crate::core::task::{Priority, Task, TaskId, TaskState};
use crate::error::DlError;
use crate::limit::TokenBucket;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-run resources handed out on admission
#[derive(Clone)]
pub struct RunResources {
    pub cancel: CancellationToken,
    pub bucket: Option<Arc<TokenBucket>>,
}

struct RunSlot {
    run_id: u64,
    resources: RunResources,
    _permit: OwnedSemaphorePermit,
}

struct Entry {
    task: Task,
    slot: Option<RunSlot>,
    /// Run id of an execution that has not returned yet
    in_flight: Option<u64>,
}

struct Inner {
    entries: HashMap<TaskId, Entry>,
    running: usize,
    peak_running: usize,
    next_run_id: u64,
    closed: bool,
}

/// Whether a popped queue entry may be admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ready,
    /// Pending, but an earlier execution has not returned yet
    Busy,
    /// Unknown, not pending, or the registry is closed
    Gone,
}

/// Outcome of a RUNNING task leaving the RUNNING state
#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub to: TaskState,
    pub error: Option<String>,
}

/// Task counts by state
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes_transferred: u64,
    pub peak_running: usize,
}

pub struct TaskRegistry {
    inner: Mutex<Inner>,
    changed: Notify,
    events: Arc<EventBus>,
}

fn invalid(id: &TaskId, from: TaskState, action: &'static str) -> DlError {
    DlError::InvalidStateTransition {
        id: id.to_string(),
        from,
        action,
    }
}

impl TaskRegistry {
    /// Registry with a private event bus nobody listens to
    pub fn new() -> Self {
        Self::with_events(Arc::new(EventBus::new()))
    }

    /// Registry publishing state changes and failures on `events`
    pub fn with_events(events: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                running: 0,
                peak_running: 0,
                next_run_id: 1,
                closed: false,
            }),
            changed: Notify::new(),
            events,
        }
    }

    /// Insert a new PENDING task, or return the existing one.
    /// The flag is true when the task was created by this call.
    pub async fn insert_or_get(
        &self,
        id: TaskId,
        priority: Priority,
        origin: Option<String>,
    ) -> (Task, bool) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get(&id) {
            return (entry.task.clone(), false);
        }

        let task = Task::new(id.clone(), priority, origin);
        inner.entries.insert(
            id,
            Entry {
                task: task.clone(),
                slot: None,
                in_flight: None,
            },
        );
        drop(inner);
        self.changed.notify_waiters();
        (task, true)
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().await.entries.get(id).map(|e| e.task.clone())
    }

    /// All tasks, oldest first
    pub async fn all(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner.entries.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub async fn state(&self, id: &str) -> Option<TaskState> {
        self.inner.lock().await.entries.get(id).map(|e| e.task.state)
    }

    /// Decide what to do with a queue entry for `id`
    pub async fn admission(&self, id: &str) -> Admission {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Admission::Gone;
        }
        match inner.entries.get(id) {
            Some(entry) if entry.task.state == TaskState::Pending => {
                if entry.in_flight.is_some() {
                    Admission::Busy
                } else {
                    Admission::Ready
                }
            }
            _ => Admission::Gone,
        }
    }

    /// Refuse every further admission
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// PENDING -> RUNNING. Hands the permit back if the task is not pending,
    /// an earlier execution is still in flight, or the registry is closed.
    pub async fn start(
        &self,
        id: &TaskId,
        permit: OwnedSemaphorePermit,
        resources: RunResources,
    ) -> Result<(Task, u64), OwnedSemaphorePermit> {
        let mut inner = self.inner.lock().await;
        let run_id = inner.next_run_id;
        if inner.closed {
            return Err(permit);
        }

        let Some(entry) = inner.entries.get_mut(id) else {
            return Err(permit);
        };
        if entry.task.state != TaskState::Pending || entry.in_flight.is_some() {
            return Err(permit);
        }

        entry.task.state = TaskState::Running;
        entry.task.started_at = Some(Utc::now());
        entry.task.ended_at = None;
        entry.task.error = None;
        entry.task.attempts += 1;
        entry.slot = Some(RunSlot {
            run_id,
            resources,
            _permit: permit,
        });
        entry.in_flight = Some(run_id);
        let task = entry.task.clone();
        self.events.state_changed(id, TaskState::Pending, TaskState::Running);

        inner.next_run_id += 1;
        inner.running += 1;
        inner.peak_running = inner.peak_running.max(inner.running);
        debug!(%id, run_id, running = inner.running, "Task entered RUNNING");
        drop(inner);

        self.changed.notify_waiters();
        Ok((task, run_id))
    }

    /// RUNNING -> COMPLETED / FAILED.
    ///
    /// With `run_id` set, only that execution may finish the task; results of
    /// an execution that was paused or cancelled underneath are discarded.
    pub async fn finish(
        &self,
        id: &str,
        run_id: Option<u64>,
        outcome: Result<u64, String>,
    ) -> Option<Finished> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get_mut(id)?;
        if entry.task.state != TaskState::Running {
            return None;
        }
        let current = entry.slot.as_ref().map(|slot| slot.run_id);
        if run_id.is_some() && run_id != current {
            return None;
        }

        // an outcome reported from outside the execution also tells it to stop
        if let Some(slot) = entry.slot.take() {
            slot.resources.cancel.cancel();
        }
        entry.task.ended_at = Some(Utc::now());
        let finished = match outcome {
            Ok(bytes) => {
                entry.task.state = TaskState::Completed;
                entry.task.bytes_transferred = bytes;
                Finished {
                    to: TaskState::Completed,
                    error: None,
                }
            }
            Err(error) => {
                entry.task.state = TaskState::Failed;
                entry.task.error = Some(error.clone());
                Finished {
                    to: TaskState::Failed,
                    error: Some(error),
                }
            }
        };
        self.events
            .state_changed(&entry.task.id, TaskState::Running, finished.to);
        if let Some(error) = &finished.error {
            self.events.error(&entry.task.id, error.clone());
        }
        inner.running -= 1;
        drop(inner);

        self.changed.notify_waiters();
        Some(finished)
    }

    /// Mark execution `run_id` as returned. Returns true if the task is
    /// pending and may now be admitted again.
    pub async fn release(&self, id: &str, run_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        if entry.in_flight != Some(run_id) {
            return false;
        }
        entry.in_flight = None;
        let pending = entry.task.state == TaskState::Pending;
        debug!(%id, run_id, pending, "Execution returned");
        drop(inner);

        self.changed.notify_waiters();
        pending
    }

    /// RUNNING -> PAUSED. Signals the execution to stop and frees its slot.
    pub async fn pause(&self, id: &str) -> Result<(), DlError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| DlError::TaskNotFound(id.to_string()))?;
        if entry.task.state != TaskState::Running {
            return Err(invalid(&entry.task.id, entry.task.state, "pause"));
        }

        if let Some(slot) = entry.slot.take() {
            slot.resources.cancel.cancel();
        }
        entry.task.state = TaskState::Paused;
        self.events
            .state_changed(&entry.task.id, TaskState::Running, TaskState::Paused);
        inner.running -= 1;
        drop(inner);

        self.changed.notify_waiters();
        Ok(())
    }

    /// PAUSED -> PENDING. Returns the task so the caller can re-queue it.
    pub async fn resume(&self, id: &str) -> Result<Task, DlError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| DlError::TaskNotFound(id.to_string()))?;
        if entry.task.state != TaskState::Paused {
            return Err(invalid(&entry.task.id, entry.task.state, "resume"));
        }

        entry.task.state = TaskState::Pending;
        self.events
            .state_changed(&entry.task.id, TaskState::Paused, TaskState::Pending);
        let task = entry.task.clone();
        drop(inner);

        self.changed.notify_waiters();
        Ok(task)
    }

    /// {PENDING, PAUSED, RUNNING} -> CANCELLED. Returns the prior state.
    ///
    /// A running execution is signalled through its cancellation token and
    /// its slot is released at once; it is expected to stop at its next
    /// chunk or request boundary.
    pub async fn cancel(&self, id: &str) -> Result<TaskState, DlError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| DlError::TaskNotFound(id.to_string()))?;
        let from = entry.task.state;
        if from.is_terminal() {
            return Err(invalid(&entry.task.id, from, "cancel"));
        }

        if let Some(slot) = entry.slot.take() {
            slot.resources.cancel.cancel();
        }
        entry.task.state = TaskState::Cancelled;
        entry.task.ended_at = Some(Utc::now());
        self.events
            .state_changed(&entry.task.id, from, TaskState::Cancelled);
        if from == TaskState::Running {
            inner.running -= 1;
        }
        drop(inner);

        self.changed.notify_waiters();
        Ok(from)
    }

    /// Remove a terminal task from the registry. A task whose last execution
    /// has not returned yet is kept, so a re-added id cannot run twice.
    pub async fn evict(&self, id: &str) -> Result<Task, DlError> {
        let mut inner = self.inner.lock().await;
        let (state, in_flight) = inner
            .entries
            .get(id)
            .map(|e| (e.task.state, e.in_flight.is_some()))
            .ok_or_else(|| DlError::TaskNotFound(id.to_string()))?;
        if !state.is_terminal() || in_flight {
            return Err(invalid(&TaskId::from(id), state, "evict"));
        }

        let entry = inner
            .entries
            .remove(id)
            .ok_or_else(|| DlError::TaskNotFound(id.to_string()))?;
        drop(inner);

        self.changed.notify_waiters();
        Ok(entry.task)
    }

    /// Ids of tasks in the given state
    pub async fn ids_in_state(&self, state: TaskState) -> Vec<TaskId> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<&Task> = inner
            .entries
            .values()
            .map(|e| &e.task)
            .filter(|t| t.state == state)
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Token buckets of every running task
    pub async fn running_buckets(&self) -> Vec<Arc<TokenBucket>> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .values()
            .filter_map(|e| e.slot.as_ref())
            .filter_map(|slot| slot.resources.bucket.clone())
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        let mut stats = RegistryStats {
            total: inner.entries.len(),
            peak_running: inner.peak_running,
            ..Default::default()
        };
        for entry in inner.entries.values() {
            stats.bytes_transferred += entry.task.bytes_transferred;
            match entry.task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Paused => stats.paused += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Wait until no task is PENDING or RUNNING
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let busy = {
                let inner = self.inner.lock().await;
                inner.entries.values().any(|e| e.task.state.is_active())
            };
            if !busy {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the task reaches a terminal state. Returns None if the task
    /// is unknown or gets evicted.
    pub async fn wait_terminal(&self, id: &str) -> Option<Task> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get(id).await {
                None => return None,
                Some(task) if task.state.is_terminal() => return Some(task),
                Some(_) => {}
            }
            notified.await;
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
