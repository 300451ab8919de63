//! Inline execution path.
//!
//! Used when the broker is unavailable at submission time. Jobs run on a
//! bounded, supervised pool: every spawned job is tracked in a `JoinSet`, a
//! panicking agent turns into a failed task instead of a stuck one, and
//! [`InlineExecutor::drain`] lets shutdown wait for in-flight work.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{ResearchJob, TaskManager, TaskUpdate};
use crate::agents::AgentRunner;
use crate::types::AppError;

/// Run the agent once and turn its outcome into the terminal update for the task
pub async fn run_agent(runner: &dyn AgentRunner, job: &ResearchJob, timeout: Option<Duration>) -> TaskUpdate {
    let run = AssertUnwindSafe(runner.run(job)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(Err(AppError::AgentExecution(format!(
                "Research timed out after {}s",
                limit.as_secs()
            )))),
        },
        None => run.await,
    };

    match outcome {
        Ok(Ok(output)) => TaskUpdate::Completed {
            task_id: job.task_id,
            result: output.result,
            files_generated: output.files_generated,
        },
        Ok(Err(e)) => TaskUpdate::Failed {
            task_id: job.task_id,
            error: e.to_string(),
        },
        Err(_) => {
            error!(task_id = %job.task_id, "Agent runner panicked");
            TaskUpdate::Failed {
                task_id: job.task_id,
                error: "Agent runner panicked".to_string(),
            }
        }
    }
}

pub struct InlineExecutor {
    manager: TaskManager,
    runner: Arc<dyn AgentRunner>,
    permits: Arc<Semaphore>,
    jobs: Mutex<JoinSet<()>>,
    timeout: Option<Duration>,
}

impl InlineExecutor {
    pub fn new(
        manager: TaskManager,
        runner: Arc<dyn AgentRunner>,
        max_concurrent: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            manager,
            runner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            jobs: Mutex::new(JoinSet::new()),
            timeout,
        }
    }

    /// Schedule `job` without waiting for it. The task stays queued until a
    /// worker slot frees up.
    pub fn spawn(&self, job: ResearchJob) {
        let manager = self.manager.clone();
        let runner = self.runner.clone();
        let permits = self.permits.clone();
        let timeout = self.timeout;

        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = jobs.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Inline job ended abnormally");
            }
        }

        jobs.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(task_id = %job.task_id, "Worker pool closed, job dropped");
                return;
            };

            // Cancelled while waiting for a slot
            if let Err(e) = manager.start(&job.task_id).await {
                info!(task_id = %job.task_id, reason = %e, "Skipping inline job");
                return;
            }

            let update = run_agent(runner.as_ref(), &job, timeout).await;
            if let Err(e) = manager.apply(update).await {
                warn!(task_id = %job.task_id, error = %e, "Could not record job outcome");
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait up to `grace` for scheduled jobs, abort the rest. Returns how many were aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner));
        if jobs.is_empty() {
            return 0;
        }
        info!(pending = jobs.len(), "Draining inline jobs");

        let waited = tokio::time::timeout(grace, async {
            while let Some(finished) = jobs.join_next().await {
                if let Err(e) = finished {
                    error!(error = %e, "Inline job ended abnormally");
                }
            }
        })
        .await;

        match waited {
            Ok(()) => {
                debug!("Inline jobs drained");
                0
            }
            Err(_) => {
                let remaining = jobs.len();
                warn!(remaining, "Grace period over, aborting inline jobs");
                jobs.shutdown().await;
                remaining
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentOutput;
    use crate::tasks::{Priority, TaskStatus, TaskStore};
    use crate::types::AppResult;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct EchoAgent;

    #[async_trait]
    impl AgentRunner for EchoAgent {
        async fn run(&self, job: &ResearchJob) -> AppResult<AgentOutput> {
            Ok(AgentOutput { result: format!("answer to {}", job.query), files_generated: vec![] })
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl AgentRunner for FailingAgent {
        async fn run(&self, _job: &ResearchJob) -> AppResult<AgentOutput> {
            Err(AppError::AgentExecution("search backend unavailable".into()))
        }
    }

    struct PanickingAgent;

    #[async_trait]
    impl AgentRunner for PanickingAgent {
        async fn run(&self, _job: &ResearchJob) -> AppResult<AgentOutput> {
            panic!("tool crashed")
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl AgentRunner for SlowAgent {
        async fn run(&self, _job: &ResearchJob) -> AppResult<AgentOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(AgentOutput::default())
        }
    }

    fn job(task_id: Uuid) -> ResearchJob {
        ResearchJob {
            task_id,
            query: "What is the capital of France?".into(),
            priority: Priority::Normal,
            max_iterations: 10,
            include_sources: true,
            create_report: false,
        }
    }

    async fn setup(runner: Arc<dyn AgentRunner>, timeout: Option<Duration>) -> (TaskManager, InlineExecutor, Uuid) {
        let manager = TaskManager::new(TaskStore::new());
        let id = Uuid::new_v4();
        manager.create(id, "What is the capital of France?", Priority::Normal).await.unwrap();
        let executor = InlineExecutor::new(manager.clone(), runner, 2, timeout);
        (manager, executor, id)
    }

    #[tokio::test]
    async fn test_run_agent_outcomes() {
        let id = Uuid::new_v4();
        let done = run_agent(&EchoAgent, &job(id), None).await;
        assert_eq!(done.status(), TaskStatus::Completed);

        let failed = run_agent(&FailingAgent, &job(id), None).await;
        assert_eq!(failed, TaskUpdate::Failed { task_id: id, error: "search backend unavailable".into() });

        let panicked = run_agent(&PanickingAgent, &job(id), None).await;
        assert_eq!(panicked.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_fails_task() {
        let id = Uuid::new_v4();
        let update = run_agent(&SlowAgent, &job(id), Some(Duration::from_millis(20))).await;
        match update {
            TaskUpdate::Failed { error, .. } => assert!(error.contains("timed out")),
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inline_job_completes() {
        let (manager, executor, id) = setup(Arc::new(EchoAgent), None).await;
        executor.spawn(job(id));
        assert_eq!(executor.drain(Duration::from_secs(5)).await, 0);

        let task = manager.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("answer to What is the capital of France?"));
    }

    #[tokio::test]
    async fn test_inline_failure_recorded() {
        let (manager, executor, id) = setup(Arc::new(PanickingAgent), None).await;
        executor.spawn(job(id));
        executor.drain(Duration::from_secs(5)).await;

        let task = manager.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Agent runner panicked"));
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped() {
        let (manager, executor, id) = setup(Arc::new(EchoAgent), None).await;
        manager.cancel(&id).await.unwrap();
        executor.spawn(job(id));
        executor.drain(Duration::from_secs(5)).await;

        assert_eq!(manager.get(&id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_drain_aborts_after_grace() {
        let (manager, executor, id) = setup(Arc::new(SlowAgent), None).await;
        executor.spawn(job(id));
        assert_eq!(executor.in_flight(), 1);

        let aborted = executor.drain(Duration::from_millis(50)).await;

        assert_eq!(aborted, 1);
        assert_eq!(executor.in_flight(), 0);
        assert_eq!(manager.get(&id).await.unwrap().status, TaskStatus::Processing);
    }
}
