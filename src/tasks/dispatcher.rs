//! Submission: validate, record the task, pick an execution path.
//!
//! The queue is preferred whenever it reports a healthy connection. Any
//! publish failure degrades to the inline pool instead of failing the
//! submission, so a caller always gets a task id back.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use super::{InlineExecutor, Priority, ResearchJob, TaskManager};
use crate::models::ResearchRequest;
use crate::queue::{TaskEnvelope, TaskQueue};
use crate::types::AppResult;

pub const MAX_ITERATIONS_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Queue,
    Inline,
}

impl ExecutionPath {
    pub fn estimated_time(&self) -> &'static str {
        match self {
            ExecutionPath::Queue => "30-120 seconds",
            ExecutionPath::Inline => "60-240 seconds",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTask {
    pub task_id: Uuid,
    pub path: ExecutionPath,
}

impl SubmittedTask {
    pub fn estimated_time(&self) -> &'static str {
        self.path.estimated_time()
    }
}

pub struct Dispatcher {
    manager: TaskManager,
    queue: Option<Arc<dyn TaskQueue>>,
    executor: Arc<InlineExecutor>,
    default_max_iterations: u32,
}

impl Dispatcher {
    pub fn new(
        manager: TaskManager,
        queue: Option<Arc<dyn TaskQueue>>,
        executor: Arc<InlineExecutor>,
        default_max_iterations: u32,
    ) -> Self {
        Self {
            manager,
            queue,
            executor,
            default_max_iterations: default_max_iterations.clamp(1, MAX_ITERATIONS_LIMIT),
        }
    }

    pub async fn submit(&self, request: ResearchRequest) -> AppResult<SubmittedTask> {
        // Nothing is recorded for a rejected request
        request.validate()?;
        let priority = match request.priority.as_deref() {
            Some(p) => p.parse::<Priority>()?,
            None => Priority::default(),
        };

        let job = ResearchJob {
            task_id: Uuid::new_v4(),
            query: request.query,
            priority,
            max_iterations: request.max_iterations.unwrap_or(self.default_max_iterations),
            include_sources: request.include_sources.unwrap_or(true),
            create_report: request.create_report.unwrap_or(false),
        };
        let task_id = job.task_id;

        self.manager.create(task_id, &job.query, priority).await?;
        let path = self.dispatch(job).await;

        info!(task_id = %task_id, path = ?path, priority = %priority, "Research task submitted");
        Ok(SubmittedTask { task_id, path })
    }

    async fn dispatch(&self, job: ResearchJob) -> ExecutionPath {
        if let Some(queue) = self.queue.as_ref().filter(|q| q.is_connected()) {
            match queue.publish(&TaskEnvelope::new(&job)).await {
                Ok(()) => return ExecutionPath::Queue,
                Err(e) => warn!(task_id = %job.task_id, error = %e, "Publish failed, running task inline"),
            }
        }

        self.executor.spawn(job);
        ExecutionPath::Inline
    }

    pub fn executor(&self) -> &Arc<InlineExecutor> {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentOutput, AgentRunner};
    use crate::tasks::{TaskStatus, TaskStore};
    use crate::types::AppError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct EchoAgent;

    #[async_trait]
    impl AgentRunner for EchoAgent {
        async fn run(&self, job: &ResearchJob) -> AppResult<AgentOutput> {
            Ok(AgentOutput { result: format!("answer to {}", job.query), files_generated: vec![] })
        }
    }

    #[derive(Default)]
    struct FakeQueue {
        connected: AtomicBool,
        fail: AtomicBool,
        published: Mutex<Vec<TaskEnvelope>>,
    }

    impl FakeQueue {
        fn connected() -> Arc<Self> {
            let queue = Self::default();
            queue.connected.store(true, Ordering::SeqCst);
            Arc::new(queue)
        }
    }

    #[async_trait]
    impl TaskQueue for FakeQueue {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn publish(&self, envelope: &TaskEnvelope) -> AppResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Transport("connection reset".into()));
            }
            self.published.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    fn dispatcher(queue: Option<Arc<FakeQueue>>) -> (TaskManager, Dispatcher) {
        let manager = TaskManager::new(TaskStore::new());
        let executor = Arc::new(InlineExecutor::new(manager.clone(), Arc::new(EchoAgent), 4, None));
        let queue = queue.map(|q| q as Arc<dyn TaskQueue>);
        (manager.clone(), Dispatcher::new(manager, queue, executor, 10))
    }

    fn request(query: &str) -> ResearchRequest {
        ResearchRequest {
            query: query.to_string(),
            priority: None,
            max_iterations: None,
            include_sources: None,
            create_report: None,
        }
    }

    #[tokio::test]
    async fn test_publishes_when_connected() {
        let queue = FakeQueue::connected();
        let (manager, dispatcher) = dispatcher(Some(queue.clone()));

        let mut req = request("What is the capital of France?");
        req.priority = Some("high".into());
        let submitted = dispatcher.submit(req).await.unwrap();

        assert_eq!(submitted.path, ExecutionPath::Queue);
        assert_eq!(submitted.estimated_time(), "30-120 seconds");
        assert_eq!(manager.get(&submitted.task_id).await.unwrap().status, TaskStatus::Queued);

        let published = queue.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].task_id, submitted.task_id);
        assert_eq!(published[0].priority, Priority::High);
        assert_eq!(published[0].max_iterations, 10);
        assert!(published[0].include_sources);
        assert!(!published[0].create_report);
    }

    #[tokio::test]
    async fn test_falls_back_when_disconnected() {
        let queue = Arc::new(FakeQueue::default());
        let (manager, dispatcher) = dispatcher(Some(queue.clone()));

        let submitted = dispatcher.submit(request("What is the capital of France?")).await.unwrap();
        assert_eq!(submitted.path, ExecutionPath::Inline);
        assert_eq!(submitted.estimated_time(), "60-240 seconds");
        assert!(queue.published.lock().unwrap().is_empty());

        dispatcher.executor().drain(Duration::from_secs(5)).await;
        assert_eq!(manager.get(&submitted.task_id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_falls_back_when_publish_fails() {
        let queue = FakeQueue::connected();
        queue.fail.store(true, Ordering::SeqCst);
        let (manager, dispatcher) = dispatcher(Some(queue));

        let submitted = dispatcher.submit(request("What is the capital of France?")).await.unwrap();
        assert_eq!(submitted.path, ExecutionPath::Inline);

        dispatcher.executor().drain(Duration::from_secs(5)).await;
        let task = manager.get(&submitted.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("answer to What is the capital of France?"));
    }

    #[tokio::test]
    async fn test_no_queue_runs_inline() {
        let (_, dispatcher) = dispatcher(None);
        let submitted = dispatcher.submit(request("Explain photosynthesis")).await.unwrap();
        assert_eq!(submitted.path, ExecutionPath::Inline);
    }

    #[tokio::test]
    async fn test_rejects_invalid_input_before_creating() {
        let (manager, dispatcher) = dispatcher(None);

        let short = dispatcher.submit(request("ab")).await;
        assert!(matches!(short, Err(AppError::Validation(_))));

        let long = dispatcher.submit(request(&"x".repeat(1001))).await;
        assert!(matches!(long, Err(AppError::Validation(_))));

        let mut bad_priority = request("What is the capital of France?");
        bad_priority.priority = Some("critical".into());
        assert!(matches!(dispatcher.submit(bad_priority).await, Err(AppError::Validation(_))));

        let mut too_many = request("What is the capital of France?");
        too_many.max_iterations = Some(21);
        assert!(matches!(dispatcher.submit(too_many).await, Err(AppError::Validation(_))));

        assert!(manager.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_query_length_counts_characters() {
        let (_, dispatcher) = dispatcher(None);
        // Three characters, nine bytes
        assert!(dispatcher.submit(request("日本語")).await.is_ok());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (_, dispatcher) = dispatcher(None);
        let a = dispatcher.submit(request("first question")).await.unwrap();
        let b = dispatcher.submit(request("second question")).await.unwrap();
        assert_ne!(a.task_id, b.task_id);
    }
}
