// Research Agent API - asynchronous research task service

pub mod config;
pub mod models;
pub mod types;
pub mod agents;
pub mod llm;
pub mod routes;
pub mod middleware;
pub mod queue;
pub mod tasks;
pub mod utils;

use std::sync::Arc;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;

use agents::AgentRunner;
use queue::TaskQueue;
use tasks::{Dispatcher, InlineExecutor, TaskManager, TaskStore};

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}

/// Wire the task store, lifecycle manager, inline pool and dispatcher around
/// an agent runner and an optional queue.
pub fn build_state(config: Config, runner: Arc<dyn AgentRunner>, queue: Option<Arc<dyn TaskQueue>>) -> AppState {
    let manager = TaskManager::new(TaskStore::new());
    let executor = Arc::new(InlineExecutor::new(
        manager.clone(),
        runner.clone(),
        config.tasks.max_concurrent,
        config.tasks.timeout,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        manager.clone(),
        queue.clone(),
        executor,
        config.agent.default_max_iterations,
    ));

    AppState {
        config,
        manager,
        dispatcher,
        queue,
        runner,
    }
}
