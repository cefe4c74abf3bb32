//! Scheduler implementation

use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::registry::{Admission, RunResources, TaskRegistry};
use crate::core::task::{Priority, Task, TaskId, TaskState};
use crate::error::DlError;

use super::queue::{QueueEntry, SchedulerStats};

struct SchedulerInner {
    queue: BinaryHeap<QueueEntry>,
    /// Entries set aside until the task's previous execution returns
    deferred: HashMap<TaskId, QueueEntry>,
    next_seq: u64,
    stats: SchedulerStats,
}

/// Priority queue plus the concurrency slots tasks are admitted into.
///
/// Queue entries are only hints: the registry decides whether a popped task is
/// still pending, so a task paused or cancelled while queued is dropped here
/// without searching the heap.
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    inner: Mutex<SchedulerInner>,
    notify: Notify,
}

impl Scheduler {
    pub fn new(max_concurrent: usize, registry: Arc<TaskRegistry>) -> Self {
        debug!(max_concurrent, "Scheduler::new: called");
        Self {
            registry,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            inner: Mutex::new(SchedulerInner {
                queue: BinaryHeap::new(),
                deferred: HashMap::new(),
                next_seq: 0,
                stats: SchedulerStats::default(),
            }),
            notify: Notify::new(),
        }
    }

    /// Queue a pending task behind every earlier entry of its priority tier
    pub async fn submit(&self, id: TaskId, priority: Priority) {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(%id, %priority, seq, "Task queued");
        inner.queue.push(QueueEntry { priority, seq, id });
        inner.stats.total_submitted += 1;
        inner.stats.peak_queue_depth = inner.stats.peak_queue_depth.max(inner.queue.len());
        drop(inner);

        self.notify.notify_one();
    }

    /// Pop the best admissible task, discarding stale entries on the way.
    ///
    /// A pending task whose previous execution is still winding down is set
    /// aside and re-queued by [`Scheduler::run`] once that execution returns.
    /// The queue lock is held across the registry check so the hand-off
    /// cannot be missed.
    pub async fn next(&self) -> Option<TaskId> {
        let mut inner = self.inner.lock().await;
        while let Some(entry) = inner.queue.pop() {
            match self.registry.admission(entry.id.as_str()).await {
                Admission::Ready => {
                    inner.stats.total_admitted += 1;
                    return Some(entry.id);
                }
                Admission::Busy => {
                    debug!(id = %entry.id, "Deferring task until its previous execution returns");
                    inner.deferred.insert(entry.id.clone(), entry);
                }
                Admission::Gone => {
                    debug!(id = %entry.id, "Skipping queue entry for task no longer pending");
                    inner.stats.total_skipped += 1;
                }
            }
        }
        None
    }

    /// Put a deferred entry back in the queue
    async fn requeue_deferred(&self, id: &TaskId) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.deferred.remove(id) {
            debug!(%id, "Re-queueing deferred task");
            inner.queue.push(entry);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Wake the scheduling loop after a slot was freed
    pub fn slot_released(&self) {
        self.notify.notify_one();
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub async fn queue_depth(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.inner.lock().await.stats.clone()
    }

    /// Admit and execute one task.
    ///
    /// Moves the task PENDING -> RUNNING, runs `work` with panics contained,
    /// then records the outcome. Returns the terminal state reached, or None
    /// if the task was not admissible or left RUNNING while `work` was in
    /// flight. Either way the execution is released once `work` returns.
    pub async fn run<F, Fut>(
        &self,
        id: &TaskId,
        permit: OwnedSemaphorePermit,
        resources: RunResources,
        work: F,
    ) -> Option<TaskState>
    where
        F: FnOnce(Task) -> Fut,
        Fut: Future<Output = Result<u64, DlError>>,
    {
        let (task, run_id) = match self.registry.start(id, permit, resources).await {
            Ok(admitted) => admitted,
            Err(permit) => {
                debug!(%id, "Task not admissible, releasing slot");
                drop(permit);
                if let Some(task) = self.registry.get(id.as_str()).await {
                    if self.registry.admission(id.as_str()).await != Admission::Gone {
                        self.submit(id.clone(), task.priority).await;
                    }
                }
                self.slot_released();
                return None;
            }
        };

        info!(%id, priority = %task.priority, attempt = task.attempts, "Task started");

        let outcome = match AssertUnwindSafe(work(task)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(DlError::Transfer(format!(
                "unit of work panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let state = self.complete(id, Some(run_id), outcome).await;
        self.registry.release(id.as_str(), run_id).await;
        self.requeue_deferred(id).await;
        state
    }

    /// Record the outcome of a running task and free its slot.
    ///
    /// Outcomes for tasks that are no longer RUNNING, or that belong to an
    /// earlier run when `run_id` is given, are discarded.
    pub async fn complete(
        &self,
        id: &TaskId,
        run_id: Option<u64>,
        outcome: Result<u64, DlError>,
    ) -> Option<TaskState> {
        let misconfigured = matches!(&outcome, Err(e) if e.is_misconfiguration());
        let outcome = outcome.map_err(|e| e.to_string());
        let Some(finished) = self.registry.finish(id.as_str(), run_id, outcome).await else {
            debug!(%id, "Discarding outcome, task is no longer running");
            return None;
        };

        match &finished.error {
            None => info!(%id, "Task completed"),
            Some(error) if misconfigured => error!(%id, %error, "Task failed on misconfiguration"),
            Some(error) => warn!(%id, %error, "Task failed"),
        }
        self.slot_released();
        Some(finished.to)
    }

    /// Admission loop. Waits for a free slot, then for a pending task, and
    /// hands both to `dispatch`. Exits on shutdown or when `dispatch` returns
    /// false.
    pub async fn run_loop<D>(self: Arc<Self>, shutdown: CancellationToken, mut dispatch: D)
    where
        D: FnMut(TaskId, OwnedSemaphorePermit) -> bool + Send,
    {
        info!(max_concurrent = self.max_concurrent, "Scheduling loop started");
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(id) = self.next().await {
                    break Some(id);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    _ = &mut notified => {}
                }
            };

            let Some(id) = next else { break };
            debug!(%id, "Dispatching task");
            if !dispatch(id, permit) {
                break;
            }
        }
        info!("Scheduling loop stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
