use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::Validate;

use crate::agents::AgentRunner;
use crate::config::Config;
use crate::queue::TaskQueue;
use crate::tasks::{Dispatcher, SubmittedTask, Task, TaskManager, TaskStatus};

const LIST_QUERY_PREVIEW_CHARS: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manager: TaskManager,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Option<Arc<dyn TaskQueue>>,
    pub runner: Arc<dyn AgentRunner>,
}

impl AppState {
    pub fn broker_connected(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.is_connected())
    }
}

// Request/response shapes for the HTTP surface

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Validate)]
pub struct ResearchRequest {
    #[validate(length(min = 3, max = 1000, message = "query must be between 3 and 1000 characters"))]
    pub query: String,
    /// One of low, normal, high, urgent
    pub priority: Option<String>,
    #[validate(range(min = 1, max = 20, message = "max_iterations must be between 1 and 20"))]
    pub max_iterations: Option<u32>,
    pub include_sources: Option<bool>,
    pub create_report: Option<bool>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResearchResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub message: String,
    pub estimated_time: String,
}

impl From<SubmittedTask> for ResearchResponse {
    fn from(submitted: SubmittedTask) -> Self {
        Self {
            task_id: submitted.task_id,
            status: TaskStatus::Queued,
            message: "Research request submitted successfully".to_string(),
            estimated_time: submitted.estimated_time().to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub query: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            status: task.status,
            query: preview(&task.query),
            created_at: task.created_at,
        }
    }
}

fn preview(query: &str) -> String {
    match query.char_indices().nth(LIST_QUERY_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &query[..cut]),
        None => query.to_string(),
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskListResponse {
    pub total_tasks: usize,
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub broker_connected: bool,
    pub agent_available: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CancelResponse {
    pub message: String,
}
