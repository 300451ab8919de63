//! Research task lifecycle
//!
//! A task moves through a fixed progression:
//!
//! ```text
//!            ┌────────────┐   runner picks up   ┌────────────┐
//! submit ──▶ │   queued   │ ──────────────────▶ │ processing │
//!            └────────────┘                     └────────────┘
//!                  │                               │      │
//!           cancel │                          ok   │      │  error
//!                  ▼                               ▼      ▼
//!            ┌────────────┐               ┌───────────┐ ┌────────┐
//!            │ cancelled  │               │ completed │ │ failed │
//!            └────────────┘               └───────────┘ └────────┘
//! ```
//!
//! - **store**: in-memory task records, the only shared mutable state
//! - **lifecycle**: the state machine and read-side queries
//! - **dispatcher**: validation, id assignment, queue or inline execution
//! - **executor**: supervised worker pool for the inline path
//! - **notify**: polled status snapshots for WebSocket clients

pub mod dispatcher;
pub mod executor;
pub mod lifecycle;
pub mod notify;
pub mod store;

pub use dispatcher::{Dispatcher, ExecutionPath, SubmittedTask};
pub use executor::InlineExecutor;
pub use lifecycle::{TaskManager, TaskResult, TaskStatusView, TaskUpdate};
pub use notify::{watch_task, TaskSnapshot};
pub use store::TaskStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Coarse progress heuristic, not a real completion percentage
    pub fn progress(&self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Processing => 50,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored and forwarded on the queue, never consulted for ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(AppError::Validation(format!(
                "priority must be one of low, normal, high, urgent (got '{}')",
                other
            ))),
        }
    }
}

/// Execution parameters that travel with a task to whichever path runs it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchJob {
    pub task_id: Uuid,
    pub query: String,
    pub priority: Priority,
    pub max_iterations: u32,
    pub include_sources: bool,
    pub create_report: bool,
}

/// A research task record.
///
/// The optional fields follow the status: `completed_at` is set once the task is
/// terminal, `result` and `files_generated` only when completed, `error` only when
/// failed. Only [`lifecycle::TaskManager`] mutates records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub query: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub files_generated: Vec<String>,
}

impl Task {
    pub fn new(task_id: Uuid, query: impl Into<String>, priority: Priority) -> Self {
        Self {
            task_id,
            query: query.into(),
            priority,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            files_generated: Vec::new(),
        }
    }

    pub fn progress(&self) -> u8 {
        self.status.progress()
    }
}
