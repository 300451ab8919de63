//! Agent System
//!
//! The task core only needs one thing from an agent: given a research job,
//! produce an answer and the list of artifacts written along the way.
//! [`AgentRunner`] is that seam; [`ResearchAgent`] is the LLM-backed runner.
//!
//! ## Pipeline Overview
//!
//! ```text
//! ResearchJob
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Draft     │  → first answer from the LLM
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Refine    │  → up to max_iterations rounds, stops on "FINAL:"
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Report    │  → optional Markdown file in the reports directory
//! └─────────────┘
//!      │
//!      ▼
//!  AgentOutput
//! ```

pub mod research;

pub use research::ResearchAgent;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tasks::ResearchJob;
use crate::types::{AppError, AppResult};

/// What a finished agent run hands back to the task core
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    pub result: String,
    pub files_generated: Vec<String>,
}

/// Executes one research job.
///
/// Queue delivery is at-least-once, so a job may be run again after a consumer
/// crash. Implementations must tolerate that.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, job: &ResearchJob) -> AppResult<AgentOutput>;

    fn is_available(&self) -> bool {
        true
    }
}

/// Stands in when no LLM credentials are configured; every run fails
pub struct UnavailableAgent {
    reason: String,
}

impl UnavailableAgent {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl AgentRunner for UnavailableAgent {
    async fn run(&self, _job: &ResearchJob) -> AppResult<AgentOutput> {
        Err(AppError::AgentExecution(self.reason.clone()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Build the runner described by the agent configuration
pub fn from_config(config: &crate::config::AgentConfig) -> std::sync::Arc<dyn AgentRunner> {
    match ResearchAgent::from_config(config) {
        Some(agent) => std::sync::Arc::new(agent),
        None => {
            tracing::warn!("No LLM API key configured, research tasks will fail");
            std::sync::Arc::new(UnavailableAgent::new("No LLM API key configured (set LLM_API_KEY)"))
        }
    }
}
