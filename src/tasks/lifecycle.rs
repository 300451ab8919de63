//! Task state machine.
//!
//! Allowed edges: queued → processing, processing → completed,
//! processing → failed, queued → cancelled. Every other request is rejected
//! with [`AppError::InvalidTransition`] and the record is left as it was.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Priority, Task, TaskStatus, TaskStore};
use crate::agents::AgentOutput;
use crate::types::{AppError, AppResult};

/// Status change reported by an execution path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskUpdate {
    Processing {
        task_id: Uuid,
    },
    Completed {
        task_id: Uuid,
        result: String,
        #[serde(default)]
        files_generated: Vec<String>,
    },
    Failed {
        task_id: Uuid,
        error: String,
    },
}

impl TaskUpdate {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskUpdate::Processing { task_id }
            | TaskUpdate::Completed { task_id, .. }
            | TaskUpdate::Failed { task_id, .. } => *task_id,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskUpdate::Processing { .. } => TaskStatus::Processing,
            TaskUpdate::Completed { .. } => TaskStatus::Completed,
            TaskUpdate::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            status: task.status,
            query: task.query.clone(),
            created_at: task.created_at,
            completed_at: task.completed_at,
            progress: task.progress(),
        }
    }
}

/// Full result view, shaped by status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskResult {
    Completed {
        task_id: Uuid,
        status: TaskStatus,
        query: String,
        result: String,
        created_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
        files_generated: Vec<String>,
    },
    Failed {
        task_id: Uuid,
        status: TaskStatus,
        query: String,
        error: String,
        created_at: DateTime<Utc>,
        failed_at: Option<DateTime<Utc>>,
    },
    Pending {
        task_id: Uuid,
        status: TaskStatus,
        query: String,
        message: String,
        progress: u8,
    },
}

impl From<Task> for TaskResult {
    fn from(task: Task) -> Self {
        match task.status {
            TaskStatus::Completed => TaskResult::Completed {
                task_id: task.task_id,
                status: task.status,
                query: task.query,
                result: task.result.unwrap_or_default(),
                created_at: task.created_at,
                completed_at: task.completed_at,
                files_generated: task.files_generated,
            },
            TaskStatus::Failed => TaskResult::Failed {
                task_id: task.task_id,
                status: task.status,
                query: task.query,
                error: task.error.unwrap_or_default(),
                created_at: task.created_at,
                failed_at: task.completed_at,
            },
            status => TaskResult::Pending {
                task_id: task.task_id,
                progress: status.progress(),
                message: match status {
                    TaskStatus::Cancelled => "Research task was cancelled".to_string(),
                    _ => "Research in progress...".to_string(),
                },
                status,
                query: task.query,
            },
        }
    }
}

fn edge_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Queued, TaskStatus::Processing)
            | (TaskStatus::Processing, TaskStatus::Completed)
            | (TaskStatus::Processing, TaskStatus::Failed)
            | (TaskStatus::Queued, TaskStatus::Cancelled)
    )
}

fn transition(task: &mut Task, to: TaskStatus) -> AppResult<()> {
    if !edge_allowed(task.status, to) {
        return Err(AppError::InvalidTransition {
            from: task.status.to_string(),
            to: to.to_string(),
        });
    }
    task.status = to;
    if to.is_terminal() {
        task.completed_at = Some(Utc::now());
    }
    Ok(())
}

/// Owns the task store and is the only writer to it
#[derive(Clone)]
pub struct TaskManager {
    store: TaskStore,
}

impl TaskManager {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    pub async fn create(&self, task_id: Uuid, query: &str, priority: Priority) -> AppResult<Task> {
        let task = Task::new(task_id, query, priority);
        self.store.insert(task.clone()).await?;
        debug!(task_id = %task_id, "Task created");
        Ok(task)
    }

    /// queued → processing.
    ///
    /// A task that is already processing is returned unchanged: a redelivered
    /// queue message re-reports the same pickup after a consumer crash.
    pub async fn start(&self, task_id: &Uuid) -> AppResult<Task> {
        let task = self
            .store
            .update(task_id, |task| {
                if task.status == TaskStatus::Processing {
                    return Ok(());
                }
                transition(task, TaskStatus::Processing)
            })
            .await?;
        info!(task_id = %task_id, "Task processing");
        Ok(task)
    }

    pub async fn complete(&self, task_id: &Uuid, output: AgentOutput) -> AppResult<Task> {
        let task = self
            .store
            .update(task_id, move |task| {
                transition(task, TaskStatus::Completed)?;
                task.result = Some(output.result);
                task.files_generated = output.files_generated;
                Ok(())
            })
            .await?;
        info!(task_id = %task_id, files = task.files_generated.len(), "Task completed");
        Ok(task)
    }

    pub async fn fail(&self, task_id: &Uuid, error: impl Into<String>) -> AppResult<Task> {
        let error = error.into();
        let task = self
            .store
            .update(task_id, move |task| {
                transition(task, TaskStatus::Failed)?;
                task.error = Some(error);
                Ok(())
            })
            .await?;
        warn!(task_id = %task_id, error = ?task.error, "Task failed");
        Ok(task)
    }

    /// queued → cancelled. Running tasks cannot be stopped, so this is rejected
    /// for anything that is not queued.
    pub async fn cancel(&self, task_id: &Uuid) -> AppResult<Task> {
        let task = self
            .store
            .update(task_id, |task| transition(task, TaskStatus::Cancelled))
            .await?;
        info!(task_id = %task_id, "Task cancelled");
        Ok(task)
    }

    pub async fn apply(&self, update: TaskUpdate) -> AppResult<Task> {
        match update {
            TaskUpdate::Processing { task_id } => self.start(&task_id).await,
            TaskUpdate::Completed { task_id, result, files_generated } => {
                self.complete(&task_id, AgentOutput { result, files_generated }).await
            }
            TaskUpdate::Failed { task_id, error } => self.fail(&task_id, error).await,
        }
    }

    /// Apply updates handed over by the queue adapter until every sender is gone
    pub async fn run_updates(&self, mut updates: mpsc::Receiver<TaskUpdate>) {
        while let Some(update) = updates.recv().await {
            let task_id = update.task_id();
            let status = update.status();
            if let Err(e) = self.apply(update).await {
                // Unknown ids belong to another API process sharing the broker
                match e {
                    AppError::NotFound(_) => debug!(task_id = %task_id, "Update for unknown task ignored"),
                    e => warn!(task_id = %task_id, status = %status, error = %e, "Update rejected"),
                }
            }
        }
        debug!("Task update channel closed");
    }

    pub async fn get_status(&self, task_id: &Uuid) -> AppResult<TaskStatusView> {
        self.get(task_id).await.map(|task| TaskStatusView::from(&task))
    }

    pub async fn get_result(&self, task_id: &Uuid) -> AppResult<TaskResult> {
        self.get(task_id).await.map(TaskResult::from)
    }

    pub async fn get(&self, task_id: &Uuid) -> AppResult<Task> {
        self.store
            .get(task_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.store.list().await
    }

    pub async fn evict_expired(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.evict_finished_before(cutoff).await;
        if removed > 0 {
            info!(removed, "Evicted expired tasks");
        }
        removed
    }

    /// Periodically evict finished tasks older than `retention`
    pub fn spawn_retention_sweeper(&self, retention: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let period = (retention / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                manager.evict_expired(retention).await;
            }
        })
    }
}
