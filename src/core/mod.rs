//! Core functionality for dlcore

pub mod config;
pub mod events;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod task;
pub mod work;

pub use config::OrchestratorConfig;
pub use events::{Event, EventBus, EventLog, Observer, SubscriberId};
pub use orchestrator::{Orchestrator, OrchestratorStats, TaskHandle};
pub use progress::*;
pub use registry::{RegistryStats, TaskRegistry};
pub use task::{Priority, Task, TaskId, TaskState};
pub use work::{TaskContext, UnitOfWork};
