//! Orchestrator: wires the registry, scheduler, limiters and unit of work together

use crate::core::config::OrchestratorConfig;
use crate::core::events::{EventBus, Observer, SubscriberId};
use crate::core::registry::{RegistryStats, RunResources, TaskRegistry};
use crate::core::task::{Priority, Task, TaskId, TaskState};
use crate::core::work::{TaskContext, UnitOfWork};
use crate::error::DlError;
use crate::limit::{OriginLimiter, TokenBucket};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::utils::detect_origin;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Snapshot of orchestrator counters
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    #[serde(flatten)]
    pub tasks: RegistryStats,
    pub queue_depth: usize,
    pub available_slots: usize,
    pub max_concurrent: usize,
    pub scheduler: SchedulerStats,
}

#[derive(Default)]
struct Handles {
    started: bool,
    scheduler: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

struct Shared {
    config: OrchestratorConfig,
    registry: Arc<TaskRegistry>,
    scheduler: Arc<Scheduler>,
    events: Arc<EventBus>,
    origins: Arc<OriginLimiter>,
    unit: Arc<dyn UnitOfWork>,
    speed_limit: AtomicU64,
    loop_token: CancellationToken,
    tracker: TaskTracker,
    handles: Mutex<Handles>,
}

impl Shared {
    fn new_bucket(&self) -> Option<Arc<TokenBucket>> {
        match self.speed_limit.load(Ordering::Relaxed) {
            0 => None,
            bps => match TokenBucket::with_window(bps, self.config.rate_window()) {
                Ok(bucket) => Some(Arc::new(bucket)),
                Err(e) => {
                    warn!(error = %e, "Could not create speed limiter, running unthrottled");
                    None
                }
            },
        }
    }

    async fn execute(self: Arc<Self>, id: TaskId, permit: OwnedSemaphorePermit) {
        let cancel = CancellationToken::new();
        let bucket = self.new_bucket();
        let resources = RunResources {
            cancel: cancel.clone(),
            bucket: bucket.clone(),
        };

        let unit = self.unit.clone();
        let origins = self.origins.clone();
        let events = self.events.clone();
        self.scheduler
            .run(&id, permit, resources, move |task| async move {
                let ctx = TaskContext::new(task, cancel, bucket, origins, events);
                unit.perform(ctx).await
            })
            .await;
    }
}

/// The orchestration core. Cheap to clone; clones share one core.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Create an orchestrator with its own origin limiter built from
    /// `config.per_origin_rules`
    pub fn new(config: OrchestratorConfig, unit: impl UnitOfWork + 'static) -> Result<Self, DlError> {
        let origins = OriginLimiter::new(
            config
                .per_origin_rules
                .iter()
                .map(|(origin, rule)| (origin.clone(), *rule)),
        )?;
        Self::with_origin_limiter(config, Arc::new(unit), Arc::new(origins))
    }

    /// Create an orchestrator that draws on a shared origin limiter
    pub fn with_origin_limiter(
        config: OrchestratorConfig,
        unit: Arc<dyn UnitOfWork>,
        origins: Arc<OriginLimiter>,
    ) -> Result<Self, DlError> {
        config.validate()?;
        for origin in config.origin_hosts.keys() {
            if !origins.has_rule(origin) {
                warn!(%origin, "Origin has host mappings but no rate-limit rule");
            }
        }

        let events = Arc::new(EventBus::new());
        let registry = Arc::new(TaskRegistry::with_events(events.clone()));
        let scheduler = Arc::new(Scheduler::new(config.max_concurrent, registry.clone()));

        debug!(
            max_concurrent = config.max_concurrent,
            speed_limit = config.default_speed_limit_bps,
            "Orchestrator created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                speed_limit: AtomicU64::new(config.default_speed_limit_bps),
                config,
                registry,
                scheduler,
                events,
                origins,
                unit,
                loop_token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                handles: Mutex::new(Handles::default()),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn origin_limiter(&self) -> &Arc<OriginLimiter> {
        &self.shared.origins
    }

    /// Start the scheduling loop and the notification loop. Tasks added
    /// before this call wait in the queue. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), DlError> {
        let mut handles = self.shared.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.loop_token.is_cancelled() {
            return Err(DlError::Shutdown);
        }
        if handles.started {
            return Ok(());
        }
        handles.started = true;
        handles.dispatcher = self.shared.events.spawn_dispatcher();

        let weak = Arc::downgrade(&self.shared);
        let scheduler = self.shared.scheduler.clone();
        let dispatch = move |id: TaskId, permit: OwnedSemaphorePermit| match weak.upgrade() {
            Some(shared) => {
                let tracker = shared.tracker.clone();
                tracker.spawn(shared.execute(id, permit));
                true
            }
            None => false,
        };
        handles.scheduler = Some(tokio::spawn(
            scheduler.run_loop(self.shared.loop_token.clone(), dispatch),
        ));

        info!(max_concurrent = self.shared.config.max_concurrent, "Orchestrator started");
        Ok(())
    }

    /// Register a task, or return the existing one with the same id. New
    /// tasks are PENDING and queued for admission.
    pub async fn add_task(&self, id: impl Into<TaskId>, priority: Priority) -> Result<TaskHandle, DlError> {
        let registry = &self.shared.registry;
        if registry.is_closed().await {
            return Err(DlError::Shutdown);
        }

        let id = id.into();
        let origin = detect_origin(id.as_str(), &self.shared.config.origin_hosts);
        let (task, created) = registry.insert_or_get(id.clone(), priority, origin).await;
        if created {
            info!(%id, %priority, origin = ?task.origin, "Task added");
            self.shared.scheduler.submit(id.clone(), task.priority).await;
        } else {
            debug!(%id, state = %task.state, "Task already registered");
        }

        Ok(self.handle(id))
    }

    /// Register a task at the configured default priority
    pub async fn add_task_default(&self, id: impl Into<TaskId>) -> Result<TaskHandle, DlError> {
        self.add_task(id, self.shared.config.default_priority).await
    }

    /// Handle for an id, whether or not it is registered
    pub fn handle(&self, id: impl Into<TaskId>) -> TaskHandle {
        TaskHandle {
            id: id.into(),
            orchestrator: self.clone(),
        }
    }

    /// RUNNING -> PAUSED. The slot is released at once and the running
    /// execution is signalled to stop.
    pub async fn pause(&self, id: &str) -> Result<(), DlError> {
        self.shared.registry.pause(id).await?;
        info!(%id, "Task paused");
        self.shared.scheduler.slot_released();
        Ok(())
    }

    /// PAUSED -> PENDING. The task re-enters the queue behind every task
    /// already waiting at its priority. It is not admitted again until its
    /// paused execution has returned.
    pub async fn resume(&self, id: &str) -> Result<(), DlError> {
        let task = self.shared.registry.resume(id).await?;
        info!(%id, "Task resumed");
        self.shared.scheduler.submit(task.id, task.priority).await;
        Ok(())
    }

    /// {PENDING, PAUSED, RUNNING} -> CANCELLED. A running execution is
    /// signalled and expected to stop at its next boundary.
    pub async fn cancel(&self, id: &str) -> Result<(), DlError> {
        let from = self.shared.registry.cancel(id).await?;
        info!(%id, %from, "Task cancelled");
        if from == TaskState::Running {
            self.shared.scheduler.slot_released();
        }
        Ok(())
    }

    /// Pause every running task. Returns how many were paused.
    pub async fn pause_all(&self) -> usize {
        let mut paused = 0;
        for id in self.shared.registry.ids_in_state(TaskState::Running).await {
            if self.pause(id.as_str()).await.is_ok() {
                paused += 1;
            }
        }
        paused
    }

    /// Resume every paused task, oldest first. Returns how many were resumed.
    pub async fn resume_all(&self) -> usize {
        let mut resumed = 0;
        for id in self.shared.registry.ids_in_state(TaskState::Paused).await {
            if self.resume(id.as_str()).await.is_ok() {
                resumed += 1;
            }
        }
        resumed
    }

    /// Finalize a running task from outside the scheduler. Returns the
    /// terminal state, or None if the task was not running.
    pub async fn on_completed(&self, id: &str, outcome: Result<u64, DlError>) -> Option<TaskState> {
        self.shared
            .scheduler
            .complete(&TaskId::from(id), None, outcome)
            .await
    }

    /// Remove a terminal task from the registry
    pub async fn evict(&self, id: &str) -> Result<Task, DlError> {
        let task = self.shared.registry.evict(id).await?;
        debug!(%id, "Task evicted");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.shared.registry.get(id).await
    }

    /// All registered tasks, oldest first
    pub async fn tasks(&self) -> Vec<Task> {
        self.shared.registry.all().await
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> SubscriberId {
        self.shared.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Wait until every event emitted so far has reached the observers
    pub async fn flush_events(&self) {
        self.shared.events.flush().await
    }

    /// Change the per-transfer speed limit (0 = unlimited). Running
    /// transfers are re-paced immediately.
    pub async fn set_speed_limit(&self, bytes_per_second: u64) -> Result<(), DlError> {
        self.shared.speed_limit.store(bytes_per_second, Ordering::Relaxed);
        // running transfers keep their bucket; unlimited means a bucket that never runs dry
        let capacity = if bytes_per_second == 0 {
            u64::MAX
        } else {
            bytes_per_second
        };
        for bucket in self.shared.registry.running_buckets().await {
            bucket.set_capacity(capacity)?;
        }
        info!(bytes_per_second, "Speed limit changed");
        Ok(())
    }

    pub fn speed_limit(&self) -> u64 {
        self.shared.speed_limit.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            tasks: self.shared.registry.stats().await,
            queue_depth: self.shared.scheduler.queue_depth().await,
            available_slots: self.shared.scheduler.available_slots(),
            max_concurrent: self.shared.scheduler.max_concurrent(),
            scheduler: self.shared.scheduler.stats().await,
        }
    }

    /// Wait until no task is PENDING or RUNNING
    pub async fn wait_idle(&self) {
        self.shared.registry.wait_idle().await
    }

    /// Stop admitting tasks, pause the running ones and wait for their
    /// executions to return. Pending tasks stay PENDING.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shared.registry.close().await;
        self.shared.loop_token.cancel();

        let (scheduler, dispatcher) = {
            let mut handles = self.shared.handles.lock().unwrap_or_else(PoisonError::into_inner);
            (handles.scheduler.take(), handles.dispatcher.take())
        };
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduling loop ended abnormally");
            }
        }

        let paused = self.pause_all().await;
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        debug!(paused, "In-flight executions finished");

        self.shared.events.close();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event dispatcher ended abnormally");
            }
        }
        info!("Orchestrator stopped");
    }
}

/// Handle to one registered task
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    orchestrator: Orchestrator,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Current copy of the task, None once evicted
    pub async fn snapshot(&self) -> Option<Task> {
        self.orchestrator.get_task(self.id.as_str()).await
    }

    pub async fn state(&self) -> Option<TaskState> {
        self.orchestrator.shared.registry.state(self.id.as_str()).await
    }

    pub async fn pause(&self) -> Result<(), DlError> {
        self.orchestrator.pause(self.id.as_str()).await
    }

    pub async fn resume(&self) -> Result<(), DlError> {
        self.orchestrator.resume(self.id.as_str()).await
    }

    pub async fn cancel(&self) -> Result<(), DlError> {
        self.orchestrator.cancel(self.id.as_str()).await
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait(&self) -> Result<Task, DlError> {
        self.orchestrator
            .shared
            .registry
            .wait_terminal(self.id.as_str())
            .await
            .ok_or_else(|| DlError::TaskNotFound(self.id.to_string()))
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{Event, EventLog};
    use crate::limit::OriginRule;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Unit of work that sleeps, tracks concurrency and records start order
    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recorder {
        fn order(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    fn sleeping_unit(recorder: Arc<Recorder>, delay: Duration) -> impl UnitOfWork {
        move |ctx: TaskContext| {
            let recorder = recorder.clone();
            async move {
                recorder.started.lock().unwrap().push(ctx.url().to_string());
                let now = recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
                recorder.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                recorder.running.fetch_sub(1, Ordering::SeqCst);
                Ok::<u64, DlError>(10)
            }
        }
    }

    /// Unit of work that runs until its task is told to stop
    fn blocking_unit() -> impl UnitOfWork {
        |ctx: TaskContext| async move {
            ctx.cancelled().await;
            Err::<u64, DlError>(DlError::Cancelled)
        }
    }

    fn config(max_concurrent: usize) -> OrchestratorConfig {
        OrchestratorConfig::default().with_max_concurrent(max_concurrent)
    }

    async fn wait_for_state(orch: &Orchestrator, id: &str, state: TaskState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while orch.get_task(id).await.map(|t| t.state) != Some(state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_priority_admission_scenario() {
        let recorder = Arc::new(Recorder::default());
        let orch = Orchestrator::new(
            config(2),
            sleeping_unit(recorder.clone(), Duration::from_millis(50)),
        )
        .unwrap();

        orch.add_task("T1", Priority::Normal).await.unwrap();
        orch.add_task("T2", Priority::Highest).await.unwrap();
        orch.add_task("T3", Priority::Normal).await.unwrap();
        orch.start().unwrap();
        orch.wait_idle().await;

        assert_eq!(recorder.order(), vec!["T2", "T1", "T3"]);
        assert!(recorder.peak.load(Ordering::SeqCst) <= 2);
        for task in orch.tasks().await {
            assert_eq!(task.state, TaskState::Completed);
            assert_eq!(task.bytes_transferred, 10);
        }
        let stats = orch.stats().await;
        assert_eq!(stats.tasks.completed, 3);
        assert!(stats.tasks.peak_running <= 2);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let recorder = Arc::new(Recorder::default());
        let orch = Orchestrator::new(
            config(3),
            sleeping_unit(recorder.clone(), Duration::from_millis(10)),
        )
        .unwrap();
        orch.start().unwrap();

        for i in 0..20 {
            let priority = Priority::try_from((i % 3) as u8).unwrap();
            orch.add_task(format!("task-{}", i), priority).await.unwrap();
        }
        orch.wait_idle().await;

        assert_eq!(recorder.order().len(), 20);
        assert!(recorder.peak.load(Ordering::SeqCst) <= 3);
        assert!(orch.stats().await.tasks.peak_running <= 3);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_task_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let orch = Orchestrator::new(config(1), sleeping_unit(recorder.clone(), Duration::ZERO)).unwrap();
        orch.start().unwrap();

        let first = orch.add_task("a", Priority::Normal).await.unwrap();
        first.wait().await.unwrap();
        let second = orch.add_task("a", Priority::Highest).await.unwrap();
        orch.wait_idle().await;

        assert_eq!(first.id(), second.id());
        assert_eq!(recorder.order(), vec!["a"]);
        let task = second.snapshot().await.unwrap();
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.attempts, 1);
        assert_eq!(orch.tasks().await.len(), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_tasks_reject_transitions() {
        let orch = Orchestrator::new(config(1), |_ctx: TaskContext| async move {
            Err::<u64, DlError>(DlError::Transfer("404".to_string()))
        })
        .unwrap();
        orch.start().unwrap();

        let handle = orch.add_task("a", Priority::Normal).await.unwrap();
        let failed = handle.wait().await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.error.as_deref(), Some("Transfer failed: 404"));

        for result in [handle.pause().await, handle.resume().await, handle.cancel().await] {
            assert!(matches!(
                result,
                Err(DlError::InvalidStateTransition {
                    from: TaskState::Failed,
                    ..
                })
            ));
        }
        let after = handle.snapshot().await.unwrap();
        assert_eq!(after.state, TaskState::Failed);
        assert_eq!(after.ended_at, failed.ended_at);
        assert_eq!(after.error, failed.error);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_tasks() {
        let orch = Orchestrator::new(config(1), |ctx: TaskContext| async move {
            match ctx.url() {
                "bad" => panic!("unit of work bug"),
                _ => Ok::<u64, DlError>(1),
            }
        })
        .unwrap();
        let log = Arc::new(EventLog::new());
        orch.subscribe(log.clone());
        orch.start().unwrap();

        orch.add_task("bad", Priority::Highest).await.unwrap();
        orch.add_task("good", Priority::Normal).await.unwrap();
        orch.wait_idle().await;
        orch.flush_events().await;

        assert_eq!(orch.get_task("bad").await.unwrap().state, TaskState::Failed);
        assert_eq!(orch.get_task("good").await.unwrap().state, TaskState::Completed);
        assert!(log.events().iter().any(|e| matches!(
            e,
            Event::Error { id, error } if id.as_str() == "bad" && error.contains("unit of work bug")
        )));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_task_never_runs() {
        let recorder = Arc::new(Recorder::default());
        let orch = Orchestrator::new(config(1), sleeping_unit(recorder.clone(), Duration::ZERO)).unwrap();

        orch.add_task("a", Priority::Normal).await.unwrap();
        orch.add_task("b", Priority::Normal).await.unwrap();
        orch.cancel("a").await.unwrap();
        orch.start().unwrap();
        orch.wait_idle().await;

        assert_eq!(recorder.order(), vec!["b"]);
        let cancelled = orch.get_task("a").await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        assert!(cancelled.started_at.is_none());
        assert!(cancelled.ended_at.is_some());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_frees_slot_and_resume_requeues() {
        let orch = Orchestrator::new(config(1), blocking_unit()).unwrap();
        let log = Arc::new(EventLog::new());
        orch.subscribe(log.clone());
        orch.start().unwrap();

        let a = orch.add_task("a", Priority::Normal).await.unwrap();
        let b = orch.add_task("b", Priority::Normal).await.unwrap();
        wait_for_state(&orch, "a", TaskState::Running).await;
        assert_eq!(b.state().await, Some(TaskState::Pending));

        a.pause().await.unwrap();
        wait_for_state(&orch, "b", TaskState::Running).await;
        assert_eq!(a.state().await, Some(TaskState::Paused));
        assert!(matches!(
            a.pause().await,
            Err(DlError::InvalidStateTransition { .. })
        ));

        a.resume().await.unwrap();
        assert_eq!(a.state().await, Some(TaskState::Pending));
        b.cancel().await.unwrap();
        wait_for_state(&orch, "a", TaskState::Running).await;
        assert_eq!(orch.get_task("a").await.unwrap().attempts, 2);

        a.cancel().await.unwrap();
        orch.wait_idle().await;
        orch.flush_events().await;
        assert_eq!(
            log.transitions(a.id()),
            vec![
                (TaskState::Pending, TaskState::Running),
                (TaskState::Running, TaskState::Paused),
                (TaskState::Paused, TaskState::Pending),
                (TaskState::Pending, TaskState::Running),
                (TaskState::Running, TaskState::Cancelled),
            ]
        );
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_goes_behind_waiting_tasks() {
        let recorder = Arc::new(Recorder::default());
        let unit = {
            let recorder = recorder.clone();
            move |ctx: TaskContext| {
                let recorder = recorder.clone();
                async move {
                    recorder.started.lock().unwrap().push(ctx.url().to_string());
                    if ctx.url() == "a" && ctx.task().attempts == 1 {
                        ctx.cancelled().await;
                        return Err(DlError::Cancelled);
                    }
                    Ok::<u64, DlError>(1)
                }
            }
        };
        let orch = Orchestrator::new(config(1), unit).unwrap();
        orch.start().unwrap();

        orch.add_task("a", Priority::Normal).await.unwrap();
        wait_for_state(&orch, "a", TaskState::Running).await;
        orch.add_task("b", Priority::Normal).await.unwrap();
        orch.add_task("c", Priority::Normal).await.unwrap();

        orch.pause("a").await.unwrap();
        orch.resume("a").await.unwrap();
        orch.wait_idle().await;

        assert_eq!(recorder.order(), vec!["a", "b", "c", "a"]);
        assert_eq!(orch.get_task("a").await.unwrap().state, TaskState::Completed);
        orch.shutdown().await;
    }

    /// Unit of work that never looks at its cancellation token
    fn stubborn_unit(executions: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> impl UnitOfWork {
        move |ctx: TaskContext| {
            let executions = executions.clone();
            let peak = peak.clone();
            async move {
                let now = executions.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                for step in 1..=4u64 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    ctx.report_progress(step * 25, Some(100));
                }
                executions.fetch_sub(1, Ordering::SeqCst);
                Ok::<u64, DlError>(100)
            }
        }
    }

    #[tokio::test]
    async fn test_resume_waits_for_stopped_execution_to_return() {
        let executions = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let orch = Orchestrator::new(config(2), stubborn_unit(executions.clone(), peak.clone())).unwrap();
        let log = Arc::new(EventLog::new());
        orch.subscribe(log.clone());
        orch.start().unwrap();

        let a = orch.add_task("a", Priority::Normal).await.unwrap();
        wait_for_state(&orch, "a", TaskState::Running).await;
        a.pause().await.unwrap();
        a.resume().await.unwrap();

        // a free slot is available, but the first execution is still going
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.state().await, Some(TaskState::Pending));

        let task = a.wait().await.unwrap();
        orch.wait_idle().await;
        orch.flush_events().await;

        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.attempts, 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(
            log.transitions(a.id()),
            vec![
                (TaskState::Pending, TaskState::Running),
                (TaskState::Running, TaskState::Paused),
                (TaskState::Paused, TaskState::Pending),
                (TaskState::Pending, TaskState::Running),
                (TaskState::Running, TaskState::Completed),
            ]
        );

        // only the second execution's progress is published after the pause
        let progress: Vec<u64> = log
            .events()
            .iter()
            .skip_while(|e| !matches!(e, Event::StateChanged { to: TaskState::Paused, .. }))
            .filter_map(|e| match e {
                Event::Progress { progress, .. } => Some(progress.downloaded_size),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![25, 50, 75, 100]);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_all_and_resume_all() {
        let orch = Orchestrator::new(config(2), blocking_unit()).unwrap();
        orch.start().unwrap();
        orch.add_task("a", Priority::Normal).await.unwrap();
        orch.add_task("b", Priority::Normal).await.unwrap();
        wait_for_state(&orch, "a", TaskState::Running).await;
        wait_for_state(&orch, "b", TaskState::Running).await;

        assert_eq!(orch.pause_all().await, 2);
        assert_eq!(orch.stats().await.tasks.paused, 2);
        assert_eq!(orch.resume_all().await, 2);
        wait_for_state(&orch, "a", TaskState::Running).await;
        wait_for_state(&orch, "b", TaskState::Running).await;

        orch.shutdown().await;
        assert_eq!(orch.stats().await.tasks.paused, 2);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_pending_and_rejects_new_tasks() {
        let orch = Orchestrator::new(config(1), blocking_unit()).unwrap();
        orch.start().unwrap();
        orch.add_task("a", Priority::Normal).await.unwrap();
        orch.add_task("b", Priority::Normal).await.unwrap();
        wait_for_state(&orch, "a", TaskState::Running).await;

        orch.shutdown().await;
        assert_eq!(orch.get_task("a").await.unwrap().state, TaskState::Paused);
        assert_eq!(orch.get_task("b").await.unwrap().state, TaskState::Pending);
        assert!(matches!(
            orch.add_task("c", Priority::Normal).await,
            Err(DlError::Shutdown)
        ));
        assert!(matches!(orch.start(), Err(DlError::Shutdown)));
    }

    #[tokio::test]
    async fn test_on_completed_finalizes_running_task() {
        let orch = Orchestrator::new(config(1), blocking_unit()).unwrap();
        orch.start().unwrap();
        let handle = orch.add_task("a", Priority::Normal).await.unwrap();
        wait_for_state(&orch, "a", TaskState::Running).await;

        assert_eq!(
            orch.on_completed("a", Ok(512)).await,
            Some(TaskState::Completed)
        );
        assert_eq!(orch.on_completed("a", Ok(1)).await, None);
        let task = handle.wait().await.unwrap();
        assert_eq!(task.bytes_transferred, 512);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_evict_terminal_task() {
        let orch = Orchestrator::new(config(1), blocking_unit()).unwrap();
        orch.add_task("a", Priority::Normal).await.unwrap();
        assert!(orch.evict("a").await.is_err());

        orch.cancel("a").await.unwrap();
        orch.evict("a").await.unwrap();
        assert!(orch.get_task("a").await.is_none());
        assert!(matches!(
            orch.handle("a").wait().await,
            Err(DlError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_origin_detection_and_misconfiguration() {
        let config = config(1)
            .without_origins()
            .with_origin_hosts("vimeo", ["vimeo.com"])
            .with_origin_hosts("bilibili", ["bilibili.com"])
            .with_origin_rule("bilibili", OriginRule::new(5, 1));
        let orch = Orchestrator::new(config, |ctx: TaskContext| async move {
            ctx.acquire_origin().await?;
            Ok::<u64, DlError>(0)
        })
        .unwrap();
        orch.start().unwrap();

        let ok = orch.add_task("https://www.bilibili.com/video/1", Priority::Normal).await.unwrap();
        let bad = orch.add_task("https://vimeo.com/1", Priority::Normal).await.unwrap();
        let plain = orch.add_task("https://example.com/file.bin", Priority::Normal).await.unwrap();
        orch.wait_idle().await;

        assert_eq!(ok.snapshot().await.unwrap().origin.as_deref(), Some("bilibili"));
        assert_eq!(ok.state().await, Some(TaskState::Completed));
        assert_eq!(plain.snapshot().await.unwrap().origin, None);
        assert_eq!(plain.state().await, Some(TaskState::Completed));

        let failed = bad.snapshot().await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.error.unwrap().contains("vimeo"));
        assert_eq!(orch.origin_limiter().in_window("bilibili").unwrap(), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_shared_origin_limiter_across_cores() {
        let origins = Arc::new(OriginLimiter::new([("bilibili", OriginRule::new(1, 60))]).unwrap());
        let config = config(1)
            .without_origins()
            .with_origin_hosts("bilibili", ["bilibili.com"]);
        let unit: Arc<dyn UnitOfWork> = Arc::new(|ctx: TaskContext| async move {
            ctx.acquire_origin().await?;
            Ok::<u64, DlError>(0)
        });

        let first = Orchestrator::with_origin_limiter(config.clone(), unit.clone(), origins.clone()).unwrap();
        let second = Orchestrator::with_origin_limiter(config, unit, origins.clone()).unwrap();
        first.start().unwrap();
        second.start().unwrap();

        first.add_task("https://bilibili.com/a", Priority::Normal).await.unwrap();
        first.wait_idle().await;
        assert!(!origins.check("bilibili").unwrap());

        let waiting = second.add_task("https://bilibili.com/b", Priority::Normal).await.unwrap();
        wait_for_state(&second, "https://bilibili.com/b", TaskState::Running).await;
        waiting.cancel().await.unwrap();

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_speed_limit_applies_to_new_and_running_tasks() {
        let orch = Orchestrator::new(config(1).with_speed_limit(1000), |ctx: TaskContext| async move {
            let bucket = ctx.bucket().cloned();
            ctx.cancelled().await;
            Ok::<u64, DlError>(bucket.map(|b| b.capacity()).unwrap_or(0))
        })
        .unwrap();
        orch.start().unwrap();
        assert_eq!(orch.speed_limit(), 1000);

        orch.add_task("a", Priority::Normal).await.unwrap();
        wait_for_state(&orch, "a", TaskState::Running).await;
        orch.set_speed_limit(4096).await.unwrap();
        assert_eq!(orch.speed_limit(), 4096);

        let buckets = orch.shared.registry.running_buckets().await;
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].capacity(), 4096);

        orch.cancel("a").await.unwrap();
        orch.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Orchestrator::new(config(0), blocking_unit());
        assert!(matches!(result, Err(DlError::InvalidArgument(_))));
    }
}
