//! In-memory task records keyed by task id.
//!
//! Lives for the lifetime of the process. Every write goes through
//! [`TaskStore::update`], which applies a change to a copy of the record and
//! commits it only if the change succeeds, so readers never see half-applied
//! transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Task;
use crate::types::{AppError, AppResult};

#[derive(Clone, Default)]
pub struct TaskStore {
    tasks: Arc<RwLock<HashMap<Uuid, Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task: Task) -> AppResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(AppError::Internal(format!("task id {} already exists", task.task_id)));
        }
        tasks.insert(task.task_id, task);
        Ok(())
    }

    pub async fn get(&self, task_id: &Uuid) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Apply `change` to the record for `task_id` as one atomic step.
    ///
    /// The stored record is replaced only when `change` returns `Ok`.
    pub async fn update<F>(&self, task_id: &Uuid, change: F) -> AppResult<Task>
    where
        F: FnOnce(&mut Task) -> AppResult<()>,
    {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get(task_id)
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;

        let mut next = current.clone();
        change(&mut next)?;
        tasks.insert(*task_id, next.clone());
        Ok(next)
    }

    /// All records, most recently created first
    pub async fn list(&self) -> Vec<Task> {
        let mut all: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Drop terminal records that finished before `cutoff`. Returns how many were removed.
    pub async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.is_some_and(|done| done < cutoff))
        });
        before - tasks.len()
    }
}
