//! Research Agent
//!
//! Drafts an answer with the configured LLM, then asks it to critique and
//! improve the draft until it declares the answer final or the iteration
//! budget runs out. Optionally writes the answer out as a Markdown report.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{AgentOutput, AgentRunner};
use crate::config::AgentConfig;
use crate::llm::{LLMAdapter, LLMMessage, LLMRequest, OpenAICompatAdapter};
use crate::tasks::ResearchJob;
use crate::types::{AppError, AppResult};

const FINAL_MARKER: &str = "FINAL:";

const SYSTEM_PROMPT: &str = "You are a careful research assistant. Answer the user's research \
question accurately and concisely, structure longer answers with headings, and say so \
explicitly when the evidence is uncertain.";

const REFINE_PROMPT: &str = "Review your previous answer for factual errors, gaps and unclear \
wording. If it cannot be meaningfully improved, reply with \"FINAL:\" followed by the answer \
unchanged. Otherwise reply with the improved answer only.";

pub struct ResearchAgent {
    llm: Arc<dyn LLMAdapter>,
    model: String,
    reports_dir: PathBuf,
}

impl ResearchAgent {
    pub fn new(llm: Arc<dyn LLMAdapter>, model: impl Into<String>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            llm,
            model: model.into(),
            reports_dir: reports_dir.into(),
        }
    }

    /// `None` when no API key is configured
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        if !config.is_available() {
            return None;
        }
        let api_key = config.api_key.as_deref()?;
        let llm = Arc::new(OpenAICompatAdapter::new(api_key, &config.provider_url));
        Some(Self::new(llm, config.model.clone(), config.reports_dir.clone()))
    }

    fn initial_prompt(job: &ResearchJob) -> String {
        let mut prompt = format!("Research question: {}", job.query);
        if job.include_sources {
            prompt.push_str(
                "\n\nEnd your answer with a \"Sources\" section listing the references \
                 (title, author or publisher, year, URL when known) that support it.",
            );
        }
        prompt
    }

    async fn complete(&self, messages: &[LLMMessage]) -> AppResult<String> {
        let request = LLMRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            max_tokens: Some(2048),
            temperature: Some(0.3),
        };
        let response = self.llm.create_chat_completion(&request).await?;
        Ok(response.content)
    }

    /// Write `answer` as a Markdown report and return its path
    async fn write_report(&self, job: &ResearchJob, answer: &str) -> AppResult<String> {
        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .map_err(|e| AppError::AgentExecution(format!("Cannot create reports directory: {}", e)))?;

        let now = Utc::now();
        let filename = format!(
            "{}_report_{}_{}.md",
            report_slug(&job.query),
            now.format("%Y%m%d_%H%M%S"),
            &job.task_id.simple().to_string()[..8]
        );
        let path = self.reports_dir.join(filename);

        let body = format!(
            "# Research Report\n\n**Query:** {}\n\n**Generated:** {}\n\n---\n\n{}\n",
            job.query,
            now.to_rfc3339(),
            answer
        );
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| AppError::AgentExecution(format!("Cannot write report: {}", e)))?;

        Ok(path.to_string_lossy().into_owned())
    }
}

/// First few words of the query, lowercased and joined with underscores
fn report_slug(query: &str) -> String {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .take(5)
        .collect();

    if words.is_empty() {
        "research".to_string()
    } else {
        words.join("_")
    }
}

#[async_trait]
impl AgentRunner for ResearchAgent {
    async fn run(&self, job: &ResearchJob) -> AppResult<AgentOutput> {
        info!(task_id = %job.task_id, max_iterations = job.max_iterations, "Starting research");

        let mut messages = vec![
            LLMMessage::system(SYSTEM_PROMPT),
            LLMMessage::user(Self::initial_prompt(job)),
        ];
        let mut answer = self.complete(&messages).await?;

        for iteration in 2..=job.max_iterations.max(1) {
            if answer.trim_start().starts_with(FINAL_MARKER) {
                break;
            }
            debug!(task_id = %job.task_id, iteration, "Refining answer");
            messages.push(LLMMessage::assistant(answer.clone()));
            messages.push(LLMMessage::user(REFINE_PROMPT));
            answer = self.complete(&messages).await?;
        }

        let answer = answer
            .trim_start()
            .strip_prefix(FINAL_MARKER)
            .unwrap_or(&answer)
            .trim()
            .to_string();
        if answer.is_empty() {
            return Err(AppError::AgentExecution("Agent produced an empty answer".to_string()));
        }

        let mut files_generated = Vec::new();
        if job.create_report {
            files_generated.push(self.write_report(job, &answer).await?);
        }

        info!(task_id = %job.task_id, answer_len = answer.len(), "Research finished");
        Ok(AgentOutput { result: answer, files_generated })
    }
}
