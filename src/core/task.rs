//! Task model: identity, priority and lifecycle state

use crate::error::DlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable task identifier. The source URL is used as the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Scheduling priority. Lower value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Highest = 0,
    #[default]
    Normal = 1,
    Background = 2,
}

impl Priority {
    /// Numeric level (0 = highest)
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = DlError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::Highest),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Background),
            _ => Err(DlError::InvalidArgument(format!(
                "priority {} is outside 0..=2",
                level
            ))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Highest => write!(f, "highest"),
            Self::Normal => write!(f, "normal"),
            Self::Background => write!(f, "background"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = DlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "highest" | "high" => Ok(Self::Highest),
            "normal" => Ok(Self::Normal),
            "background" | "low" => Ok(Self::Background),
            other => match other.parse::<u8>() {
                Ok(level) => Self::try_from(level),
                Err(_) => Err(DlError::InvalidArgument(format!("unknown priority: {}", s))),
            },
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Completed, failed and cancelled tasks never change state again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending or running
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The unit the system schedules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub priority: Priority,
    pub state: TaskState,
    /// Rate-limit budget this task draws from, if its URL maps to a known platform
    pub origin: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set only in FAILED
    pub error: Option<String>,
    pub bytes_transferred: u64,
    /// Number of times the task has been admitted
    pub attempts: u32,
}

impl Task {
    pub fn new(id: TaskId, priority: Priority, origin: Option<String>) -> Self {
        Self {
            id,
            priority,
            state: TaskState::Pending,
            origin,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            bytes_transferred: 0,
            attempts: 0,
        }
    }

    /// Wall-clock time between admission and the terminal state
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Highest < Priority::Normal);
        assert!(Priority::Normal < Priority::Background);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_from_level() {
        assert_eq!(Priority::try_from(0).unwrap(), Priority::Highest);
        assert_eq!(Priority::try_from(2).unwrap(), Priority::Background);
        assert!(matches!(
            Priority::try_from(3),
            Err(DlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGHEST".parse::<Priority>().unwrap(), Priority::Highest);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Background);
        assert_eq!("1".parse::<Priority>().unwrap(), Priority::Normal);
        assert!("7".parse::<Priority>().is_err());
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_serde() {
        let json = serde_json::to_string(&Priority::Background).unwrap();
        assert_eq!(json, "\"background\"");
        let p: Priority = serde_json::from_str("\"highest\"").unwrap();
        assert_eq!(p, Priority::Highest);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
        assert!(TaskState::Running.is_active());
        assert!(!TaskState::Paused.is_active());
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new(TaskId::from("https://youtu.be/abc"), Priority::Normal, None);
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.started_at.is_none());
        assert!(task.ended_at.is_none());
        assert!(task.error.is_none());
        assert!(task.elapsed().is_none());
    }
}
