//! The pluggable unit of work and the context handed to it

use crate::core::events::EventBus;
use crate::core::progress::Progress;
use crate::core::task::{Priority, Task, TaskId};
use crate::error::DlError;
use crate::limit::{OriginLimiter, TokenBucket};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// The job a task performs once admitted. Returns the number of bytes
/// transferred on success.
///
/// Implementations should poll [`TaskContext::is_cancelled`] (or await through
/// [`TaskContext::throttle`]) at chunk or request boundaries; a cancelled
/// context means the task was paused, cancelled or the core is shutting down.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn perform(&self, ctx: TaskContext) -> Result<u64, DlError>;
}

#[async_trait]
impl<F, Fut> UnitOfWork for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<u64, DlError>> + Send + 'static,
{
    async fn perform(&self, ctx: TaskContext) -> Result<u64, DlError> {
        self(ctx).await
    }
}

struct ContextInner {
    task: Task,
    cancel: CancellationToken,
    bucket: Option<Arc<TokenBucket>>,
    origins: Arc<OriginLimiter>,
    events: Arc<EventBus>,
    progress: Mutex<Progress>,
}

/// Handle a running task uses to cooperate with the core
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    pub(crate) fn new(
        task: Task,
        cancel: CancellationToken,
        bucket: Option<Arc<TokenBucket>>,
        origins: Arc<OriginLimiter>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                task,
                cancel,
                bucket,
                origins,
                events,
                progress: Mutex::new(Progress::new(None)),
            }),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.inner.task.id
    }

    /// The task id doubles as the source URL
    pub fn url(&self) -> &str {
        self.inner.task.id.as_str()
    }

    pub fn priority(&self) -> Priority {
        self.inner.task.priority
    }

    pub fn origin(&self) -> Option<&str> {
        self.inner.task.origin.as_deref()
    }

    /// Snapshot of the task taken at admission
    pub fn task(&self) -> &Task {
        &self.inner.task
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Completes once the task should stop
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn check_cancelled(&self) -> Result<(), DlError> {
        if self.is_cancelled() {
            Err(DlError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Speed limiter for this task, if one is configured
    pub fn bucket(&self) -> Option<&Arc<TokenBucket>> {
        self.inner.bucket.as_ref()
    }

    /// Wait until `bytes` may be consumed under the speed limit
    pub async fn throttle(&self, bytes: u64) -> Result<(), DlError> {
        let Some(bucket) = &self.inner.bucket else {
            return self.check_cancelled();
        };
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(DlError::Cancelled),
            _ = bucket.acquire(bytes) => Ok(()),
        }
    }

    /// Wait for a request slot in this task's origin budget. Tasks without an
    /// origin are not limited.
    pub async fn acquire_origin(&self) -> Result<(), DlError> {
        let Some(origin) = self.origin() else {
            return self.check_cancelled();
        };
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(DlError::Cancelled),
            result = self.inner.origins.acquire(origin) => result,
        }
    }

    /// Publish a progress update to observers. Once the execution has been
    /// told to stop its updates are no longer published, so a resumed task
    /// never shows two progress streams.
    pub fn report_progress(&self, downloaded: u64, total: Option<u64>) {
        let rate = self.inner.bucket.as_ref().map(|bucket| bucket.current_rate());
        let snapshot = {
            let mut progress = self
                .inner
                .progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            progress.update(downloaded, total, rate);
            progress.clone()
        };
        if self.is_cancelled() {
            return;
        }
        self.inner.events.progress(self.id(), snapshot);
    }

    /// Latest progress reported by this task
    pub fn progress(&self) -> Progress {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
