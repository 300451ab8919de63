//! Polled status snapshots for a single task.
//!
//! Each subscriber gets its own lazy stream. Dropping the stream stops the
//! polling, there is nothing to unregister.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Serialize;
use uuid::Uuid;

use super::{Task, TaskManager, TaskStatus};
use crate::types::AppResult;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        let message = match task.status {
            TaskStatus::Completed => Some("Research completed".to_string()),
            TaskStatus::Failed => task.error.clone(),
            TaskStatus::Cancelled => Some("Research task was cancelled".to_string()),
            TaskStatus::Queued | TaskStatus::Processing => None,
        };
        Self {
            task_id: task.task_id,
            status: task.status,
            progress: task.progress(),
            timestamp: Utc::now(),
            message,
        }
    }
}

/// Emit a snapshot of `task_id` immediately and then every `interval`,
/// ending after the first terminal snapshot. An unknown task yields a single
/// `NotFound` error.
pub fn watch_task(
    manager: TaskManager,
    task_id: Uuid,
    interval: Duration,
) -> impl Stream<Item = AppResult<TaskSnapshot>> {
    let period = interval.max(MIN_INTERVAL);

    stream::unfold(Some((manager, None)), move |state| async move {
        let (manager, ticker) = state?;
        let mut ticker = ticker.unwrap_or_else(|| tokio::time::interval(period));
        ticker.tick().await;

        match manager.get(&task_id).await {
            Ok(task) => {
                let snapshot = TaskSnapshot::from(&task);
                let next = if task.status.is_terminal() { None } else { Some((manager, Some(ticker))) };
                Some((Ok(snapshot), next))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentOutput;
    use crate::tasks::{Priority, TaskStore};
    use crate::types::AppError;
    use futures::StreamExt;

    async fn manager_with_task() -> (TaskManager, Uuid) {
        let manager = TaskManager::new(TaskStore::new());
        let id = Uuid::new_v4();
        manager.create(id, "What is the capital of France?", Priority::Normal).await.unwrap();
        (manager, id)
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_snapshot() {
        let (manager, id) = manager_with_task().await;
        let updater = manager.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            updater.start(&id).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            updater
                .complete(&id, AgentOutput { result: "Paris".into(), files_generated: vec![] })
                .await
                .unwrap();
        });

        let snapshots: Vec<TaskSnapshot> = watch_task(manager, id, Duration::from_millis(10))
            .map(|s| s.unwrap())
            .collect()
            .await;

        assert_eq!(snapshots.first().unwrap().status, TaskStatus::Queued);
        let last = snapshots.last().unwrap();
        assert_eq!(last.status, TaskStatus::Completed);
        assert_eq!(last.progress, 100);
        assert_eq!(snapshots.iter().filter(|s| s.status.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_task_yields_one_snapshot() {
        let (manager, id) = manager_with_task().await;
        manager.cancel(&id).await.unwrap();

        let snapshots: Vec<_> = watch_task(manager, id, Duration::from_millis(10)).collect().await;
        assert_eq!(snapshots.len(), 1);
        let snapshot = snapshots[0].as_ref().unwrap();
        assert_eq!(snapshot.status, TaskStatus::Cancelled);
        assert_eq!(snapshot.message.as_deref(), Some("Research task was cancelled"));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let manager = TaskManager::new(TaskStore::new());
        let items: Vec<_> = watch_task(manager, Uuid::new_v4(), Duration::from_millis(10)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_snapshot_omits_empty_message() {
        let task = Task::new(Uuid::new_v4(), "What is the capital of France?", Priority::Normal);
        let json = serde_json::to_value(TaskSnapshot::from(&task)).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["progress"], 0);
        assert!(json.get("message").is_none());
    }
}
