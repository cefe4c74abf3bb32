//! Priority admission of tasks into bounded concurrency slots

mod core;
mod queue;

pub use self::core::Scheduler;
pub use self::queue::{QueueEntry, SchedulerStats};
