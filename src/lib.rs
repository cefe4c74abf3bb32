//! # dlcore - download orchestration core
//!
//! Schedules many downloads at once without a UI or a particular transport.
//!
//! ## Features
//!
//! - Priority admission (highest, normal, background) with FIFO order inside a tier
//! - Bounded concurrency with explicit slot release
//! - Per-transfer token-bucket bandwidth limiting
//! - Per-origin sliding-window request budgets
//! - Pause, resume and cooperative cancellation
//! - Observer hooks delivered from a single notification loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use dlcore::{DlError, Orchestrator, OrchestratorConfig, Priority, TaskContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), DlError> {
//!     let config = OrchestratorConfig::default().with_max_concurrent(2);
//!     let orchestrator = Orchestrator::new(config, |ctx: TaskContext| async move {
//!         ctx.acquire_origin().await?;
//!         ctx.throttle(1024).await?;
//!         Ok::<u64, DlError>(1024)
//!     })?;
//!     orchestrator.start()?;
//!
//!     let handle = orchestrator
//!         .add_task("https://www.youtube.com/watch?v=abc", Priority::Highest)
//!         .await?;
//!     let task = handle.wait().await?;
//!     println!("{} finished as {}", task.id, task.state);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod core;
pub mod download;
pub mod error;
pub mod limit;
pub mod scheduler;
pub mod utils;

// Re-export main types
pub use crate::core::{
    Observer, Orchestrator, OrchestratorConfig, Priority, Progress, Task, TaskContext, TaskHandle,
    TaskId, TaskState, UnitOfWork,
};
pub use error::DlError;
pub use limit::{OriginLimiter, OriginRule, TokenBucket};

/// Result type alias for dlcore operations
pub type Result<T> = std::result::Result<T, DlError>;
