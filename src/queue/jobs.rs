// Task envelope: the message exchanged over the task stream

use chrono::{DateTime, Utc};
use redis::streams::StreamId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::{Priority, ResearchJob};
use crate::types::{AppError, AppResult};

pub const FIELD_BODY: &str = "body";
pub const FIELD_TASK_ID: &str = "task_id";
pub const FIELD_PRIORITY: &str = "priority";
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Everything a consumer needs to run a research task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub query: String,
    pub priority: Priority,
    pub max_iterations: u32,
    pub include_sources: bool,
    pub create_report: bool,
    pub timestamp: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(job: &ResearchJob) -> Self {
        Self {
            task_id: job.task_id,
            query: job.query.clone(),
            priority: job.priority,
            max_iterations: job.max_iterations,
            include_sources: job.include_sources,
            create_report: job.create_report,
            timestamp: Utc::now(),
        }
    }

    pub fn job(&self) -> ResearchJob {
        ResearchJob {
            task_id: self.task_id,
            query: self.query.clone(),
            priority: self.priority,
            max_iterations: self.max_iterations,
            include_sources: self.include_sources,
            create_report: self.create_report,
        }
    }

    /// Stream entry fields: the JSON body plus routing metadata kept outside it
    pub fn to_fields(&self) -> AppResult<Vec<(&'static str, String)>> {
        Ok(vec![
            (FIELD_BODY, serde_json::to_string(self)?),
            (FIELD_TASK_ID, self.task_id.to_string()),
            (FIELD_PRIORITY, self.priority.to_string()),
            (FIELD_TIMESTAMP, self.timestamp.to_rfc3339()),
        ])
    }

    pub fn from_stream_entry(entry: &StreamId) -> AppResult<Self> {
        Self::from_body(entry.get::<String>(FIELD_BODY).as_deref(), &entry.id)
    }

    fn from_body(body: Option<&str>, entry_id: &str) -> AppResult<Self> {
        let body = body.ok_or_else(|| AppError::Transport(format!("message {} has no body field", entry_id)))?;
        Ok(serde_json::from_str(body)?)
    }
}
