//! Observer hooks for progress, state changes and errors.
//!
//! Events are queued on an unbounded channel and delivered by a single
//! dispatcher task, so observers are always invoked from one place, in the
//! order events were emitted. UI layers marshal to their own thread from there.

use crate::core::progress::Progress;
use crate::core::task::{TaskId, TaskState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callbacks invoked on the notification loop. All methods default to no-ops.
pub trait Observer: Send + Sync {
    fn on_progress(&self, _id: &TaskId, _progress: &Progress) {}

    fn on_state_changed(&self, _id: &TaskId, _from: TaskState, _to: TaskState) {}

    fn on_error(&self, _id: &TaskId, _error: &str) {}
}

/// Event emitted by the orchestration core
#[derive(Debug, Clone)]
pub enum Event {
    Progress {
        id: TaskId,
        progress: Progress,
    },
    StateChanged {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },
    Error {
        id: TaskId,
        error: String,
    },
}

enum Envelope {
    Event(Event),
    Flush(oneshot::Sender<()>),
    Close,
}

/// Handle identifying a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Observers = Arc<RwLock<Vec<(SubscriberId, Arc<dyn Observer>)>>>;

/// Fan-out of core events to registered observers
pub struct EventBus {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    observers: Observers,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            observers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        debug!(?id, "Observer subscribed");
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    /// Queue an event for delivery. Events emitted after close are dropped.
    pub fn emit(&self, event: Event) {
        if self.tx.send(Envelope::Event(event)).is_err() {
            debug!("Event dropped after dispatcher shut down");
        }
    }

    pub fn progress(&self, id: &TaskId, progress: Progress) {
        self.emit(Event::Progress {
            id: id.clone(),
            progress,
        });
    }

    pub fn state_changed(&self, id: &TaskId, from: TaskState, to: TaskState) {
        self.emit(Event::StateChanged {
            id: id.clone(),
            from,
            to,
        });
    }

    pub fn error(&self, id: &TaskId, error: impl Into<String>) {
        self.emit(Event::Error {
            id: id.clone(),
            error: error.into(),
        });
    }

    /// Start the notification loop. Returns None if it was already started.
    pub fn spawn_dispatcher(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        let observers = self.observers.clone();

        Some(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Event(event) => dispatch(&observers, &event),
                    Envelope::Flush(done) => {
                        let _ = done.send(());
                    }
                    Envelope::Close => break,
                }
            }
            debug!("Event dispatcher stopped");
        }))
    }

    /// Wait until every event emitted before this call has been delivered
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Envelope::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Ask the dispatcher to stop after delivering queued events
    pub fn close(&self) {
        let _ = self.tx.send(Envelope::Close);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(observers: &Observers, event: &Event) {
    let observers: Vec<Arc<dyn Observer>> = observers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, observer)| observer.clone())
        .collect();

    for observer in observers {
        let delivered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match event {
            Event::Progress { id, progress } => observer.on_progress(id, progress),
            Event::StateChanged { id, from, to } => observer.on_state_changed(id, *from, *to),
            Event::Error { id, error } => observer.on_error(id, error),
        }));
        if delivered.is_err() {
            warn!("Observer panicked while handling event");
        }
    }
}

/// Observer that records every event, for tests and diagnostics
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// State transitions recorded for one task, in delivery order
    pub fn transitions(&self, id: &TaskId) -> Vec<(TaskState, TaskState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::StateChanged { id: eid, from, to } if &eid == id => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

impl Observer for EventLog {
    fn on_progress(&self, id: &TaskId, progress: &Progress) {
        self.push(Event::Progress {
            id: id.clone(),
            progress: progress.clone(),
        });
    }

    fn on_state_changed(&self, id: &TaskId, from: TaskState, to: TaskState) {
        self.push(Event::StateChanged {
            id: id.clone(),
            from,
            to,
        });
    }

    fn on_error(&self, id: &TaskId, error: &str) {
        self.push(Event::Error {
            id: id.clone(),
            error: error.to_string(),
        });
    }
}
